use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Physical calibration target kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Chessboard,
    CirclesGrid,
    AsymmetricCirclesGrid,
    AprilGrid,
}

/// Pattern descriptor handed to the detector and the solver.
///
/// `cols` x `rows` counts inner corners for a chessboard, circles for the
/// circle grids and tags for an AprilGrid. `spacing` is the square width,
/// the circle pitch or the tag size, in board units. `tag_spacing` is the gap
/// between AprilGrid tags as a fraction of the tag size and is ignored by the
/// other pattern types.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub pattern_type: PatternType,
    pub cols: usize,
    pub rows: usize,
    pub spacing: f32,
    #[serde(default)]
    pub tag_spacing: f32,
}

impl PatternSpec {
    pub fn default_for(pattern_type: PatternType) -> PatternSpec {
        match pattern_type {
            PatternType::Chessboard => PatternSpec {
                pattern_type,
                cols: 7,
                rows: 5,
                spacing: 30.0,
                tag_spacing: 0.0,
            },
            PatternType::CirclesGrid => PatternSpec {
                pattern_type,
                cols: 7,
                rows: 5,
                spacing: 20.0,
                tag_spacing: 0.0,
            },
            PatternType::AsymmetricCirclesGrid => PatternSpec {
                pattern_type,
                cols: 4,
                rows: 11,
                spacing: 20.0,
                tag_spacing: 0.0,
            },
            PatternType::AprilGrid => PatternSpec {
                pattern_type,
                cols: 6,
                rows: 6,
                spacing: 0.088,
                tag_spacing: 0.3,
            },
        }
    }

    /// Number of feature positions a complete detection yields.
    pub fn expected_corner_count(&self) -> usize {
        match self.pattern_type {
            PatternType::AprilGrid => self.cols * self.rows * 4,
            _ => self.cols * self.rows,
        }
    }
}

impl Default for PatternSpec {
    fn default() -> Self {
        PatternSpec::default_for(PatternType::Chessboard)
    }
}

/// One confirmed, refined set of corner positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedSet {
    pub time_ns: i64,
    pub corners: Vec<Vec2>,
}

/// Pinhole intrinsics of a solved camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParams {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Result of a completed calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    pub params: CameraParams,
    pub err_min: f64,
    pub err_avg: f64,
    pub err_max: f64,
    pub view_count: usize,
}
