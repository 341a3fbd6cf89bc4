use std::collections::HashMap;

use crate::types::{PatternSpec, PatternType};

pub struct Board {
    pub id_to_3d: HashMap<u32, glam::Vec3>,
}

impl Board {
    pub fn from_pattern(pattern: &PatternSpec) -> Board {
        match pattern.pattern_type {
            PatternType::AprilGrid => Self::init_aprilgrid(
                pattern.spacing,
                pattern.tag_spacing,
                pattern.rows,
                pattern.cols,
                0,
            ),
            PatternType::Chessboard | PatternType::CirclesGrid => {
                Self::init_grid(pattern.spacing, pattern.rows, pattern.cols, false)
            }
            PatternType::AsymmetricCirclesGrid => {
                Self::init_grid(pattern.spacing, pattern.rows, pattern.cols, true)
            }
        }
    }

    /// Row-major grid, one point per corner / circle centre.
    ///
    /// Staggered grids shift every odd row by one pitch, with columns two
    /// pitches apart.
    pub fn init_grid(spacing: f32, rows: usize, cols: usize, staggered: bool) -> Board {
        let mut id_to_3d = HashMap::new();
        let mut count_id = 0;
        for r in 0..rows {
            for c in 0..cols {
                let x = if staggered {
                    (2 * c + r % 2) as f32 * spacing
                } else {
                    c as f32 * spacing
                };
                id_to_3d.insert(
                    count_id,
                    glam::Vec3 {
                        x,
                        y: r as f32 * spacing,
                        z: 0.0,
                    },
                );
                count_id += 1;
            }
        }
        Board { id_to_3d }
    }

    pub fn init_aprilgrid(
        tag_size_meter: f32,
        tag_spacing: f32,
        tag_rows: usize,
        tag_cols: usize,
        first_id: u32,
    ) -> Board {
        let mut id_to_3d = HashMap::new();
        let mut count_id = first_id * 4;
        for r in 0..tag_rows {
            for c in 0..tag_cols {
                let start_x = (c as f32) * tag_size_meter * (1.0 + tag_spacing);
                let start_y = -1.0 * (r as f32) * tag_size_meter * (1.0 + tag_spacing);
                let corners = [
                    (start_x, start_y),
                    (start_x + tag_size_meter, start_y),
                    (start_x + tag_size_meter, start_y - tag_size_meter),
                    (start_x, start_y - tag_size_meter),
                ];
                for (i, (x, y)) in corners.into_iter().enumerate() {
                    id_to_3d.insert(count_id + i as u32, glam::Vec3 { x, y, z: 0.0 });
                }
                count_id += 4;
            }
        }
        Board { id_to_3d }
    }

    /// Board points ordered by id, the order detectors report corners in.
    pub fn ordered_points(&self) -> Vec<glam::Vec3> {
        let mut ids: Vec<_> = self.id_to_3d.keys().copied().collect();
        ids.sort_unstable();
        ids.iter().map(|id| self.id_to_3d[id]).collect()
    }
}

impl PatternSpec {
    /// Planar reference points of the pattern, in capture order.
    pub fn object_points(&self) -> Vec<glam::Vec3> {
        Board::from_pattern(self).ordered_points()
    }
}
