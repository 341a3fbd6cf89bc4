use std::collections::HashMap;

use aprilgrid::detector::TagDetector;
use aprilgrid::TagFamily;
use calib_targets::chessboard::{ChessboardDetector as GridSearch, ChessboardParams};
use calib_targets::detect::detect_corners_default;
use glam::Vec2;
use image::{DynamicImage, GrayImage};
use log::trace;

use crate::types::{PatternSpec, PatternType};

/// Outcome of one corner-finding run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Every feature of the pattern was located.
    pub found: bool,
    /// Feature positions in pattern order; partial or empty when `found` is false.
    pub corners: Vec<Vec2>,
}

/// Boundary to the feature detection library.
///
/// Implementations are called from the corner finder thread and from the
/// capture path, so they must be shareable. Both calls may be slow.
pub trait FeatureDetector: Send + Sync {
    /// Whether `detect` can handle this pattern type at all.
    fn supports(&self, pattern_type: PatternType) -> bool;

    fn detect(&self, image: &GrayImage, pattern: &PatternSpec) -> Detection;

    /// Sub-pixel refinement of a complete detection.
    fn refine_corners(&self, _image: &GrayImage, corners: &[Vec2], _pattern: &PatternSpec) -> Vec<Vec2> {
        corners.to_vec()
    }
}

/// AprilGrid corner finder backed by `aprilgrid`.
///
/// Tag corners come out of the tag detector already refined, so the default
/// `refine_corners` is kept.
pub struct AprilGridDetector {
    tag_detector: TagDetector,
}

impl AprilGridDetector {
    pub fn new(tag_family: &TagFamily) -> AprilGridDetector {
        AprilGridDetector {
            tag_detector: TagDetector::new(tag_family, None),
        }
    }
}

impl FeatureDetector for AprilGridDetector {
    fn supports(&self, pattern_type: PatternType) -> bool {
        pattern_type == PatternType::AprilGrid
    }

    fn detect(&self, image: &GrayImage, pattern: &PatternSpec) -> Detection {
        let img = DynamicImage::ImageLuma8(image.clone());
        let max_id = pattern.expected_corner_count() as u32;
        let detected_tag = self.tag_detector.detect(&img);
        let id_to_corner: HashMap<u32, Vec2> = detected_tag
            .iter()
            .flat_map(|(k, v)| {
                v.iter()
                    .enumerate()
                    .filter_map(|(i, p)| {
                        let id = k * 4 + i as u32;
                        if id < max_id {
                            Some((id, Vec2::new(p.0, p.1)))
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        let mut ids: Vec<_> = id_to_corner.keys().copied().collect();
        ids.sort_unstable();
        let corners: Vec<_> = ids.iter().map(|id| id_to_corner[id]).collect();
        trace!("aprilgrid: {}/{} corners", corners.len(), max_id);
        Detection {
            found: corners.len() == max_id as usize,
            corners,
        }
    }
}

/// Chessboard corner finder backed by `calib-targets`.
///
/// ChESS corners are grouped into a grid and reported row by row. Captured
/// corners are refined with `refine_corner`.
#[derive(Debug, Clone, Copy)]
pub struct ChessboardDetector {
    /// Half size of the refinement window, in pixels.
    pub refine_half_window: i32,
    pub refine_iterations: usize,
}

impl Default for ChessboardDetector {
    fn default() -> Self {
        Self {
            refine_half_window: 5,
            refine_iterations: 100,
        }
    }
}

/// Orders grid-labelled corners row-major for a `cols` x `rows` board.
///
/// The grid search may report the board transposed; both orientations are
/// accepted. Returns `None` unless every cell is filled exactly once.
fn order_grid(labeled: &[(i32, i32, Vec2)], cols: usize, rows: usize) -> Option<Vec<Vec2>> {
    if labeled.len() != cols * rows {
        return None;
    }
    let min_i = labeled.iter().map(|c| c.0).min()?;
    let max_i = labeled.iter().map(|c| c.0).max()?;
    let min_j = labeled.iter().map(|c| c.1).min()?;
    let max_j = labeled.iter().map(|c| c.1).max()?;
    let span = ((max_i - min_i + 1) as usize, (max_j - min_j + 1) as usize);
    let transposed = if span == (cols, rows) {
        false
    } else if span == (rows, cols) {
        true
    } else {
        return None;
    };

    let mut slots: Vec<Option<Vec2>> = vec![None; cols * rows];
    for (i, j, p) in labeled {
        let (c, r) = if transposed {
            (j - min_j, i - min_i)
        } else {
            (i - min_i, j - min_j)
        };
        if slots[r as usize * cols + c as usize].replace(*p).is_some() {
            return None;
        }
    }
    slots.into_iter().collect()
}

impl FeatureDetector for ChessboardDetector {
    fn supports(&self, pattern_type: PatternType) -> bool {
        pattern_type == PatternType::Chessboard
    }

    fn detect(&self, image: &GrayImage, pattern: &PatternSpec) -> Detection {
        let corners = detect_corners_default(image);
        let params = ChessboardParams {
            expected_rows: Some(pattern.rows as u32),
            expected_cols: Some(pattern.cols as u32),
            ..ChessboardParams::default()
        };
        let Some(result) = GridSearch::new(params).detect_from_corners(&corners) else {
            trace!("chessboard: no grid among {} corners", corners.len());
            return Detection::default();
        };
        let labeled: Vec<(i32, i32, Vec2)> = result
            .detection
            .corners
            .iter()
            .filter_map(|c| {
                let g = c.grid.as_ref()?;
                Some((g.i, g.j, Vec2::new(c.position.x, c.position.y)))
            })
            .collect();
        trace!(
            "chessboard: {}/{} corners",
            labeled.len(),
            pattern.expected_corner_count()
        );
        match order_grid(&labeled, pattern.cols, pattern.rows) {
            Some(corners) => Detection {
                found: true,
                corners,
            },
            None => Detection {
                found: false,
                corners: labeled.iter().map(|c| c.2).collect(),
            },
        }
    }

    fn refine_corners(&self, image: &GrayImage, corners: &[Vec2], _pattern: &PatternSpec) -> Vec<Vec2> {
        corners
            .iter()
            .map(|c| refine_corner(image, *c, self.refine_half_window, self.refine_iterations))
            .collect()
    }
}

fn sample(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (w, h) = image.dimensions();
    let x0 = (x.floor().max(0.0) as u32).min(w - 1);
    let y0 = (y.floor().max(0.0) as u32).min(h - 1);
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = (x - x0 as f32).clamp(0.0, 1.0);
    let fy = (y - y0 as f32).clamp(0.0, 1.0);
    let px = |x: u32, y: u32| image.get_pixel(x, y)[0] as f32;
    let top = px(x0, y0) * (1.0 - fx) + px(x1, y0) * fx;
    let bottom = px(x0, y1) * (1.0 - fx) + px(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Gradient-based sub-pixel corner refinement.
///
/// Moves the corner to the point where the gradients inside a
/// `(2 * half_window + 1)` square window are orthogonal to the vectors
/// pointing at it. Stops once an update is below 0.01 px. A corner that
/// wanders out of its window, or a window without structure, keeps the input
/// position.
pub fn refine_corner(image: &GrayImage, corner: Vec2, half_window: i32, max_iterations: usize) -> Vec2 {
    let (w, h) = image.dimensions();
    if w < 4 || h < 4 || half_window < 1 {
        return corner;
    }
    let (max_x, max_y) = (w as f32 - 2.0, h as f32 - 2.0);
    let sigma2 = (half_window * half_window) as f64;
    let mut p = corner;
    for _ in 0..max_iterations {
        let (mut gxx, mut gxy, mut gyy) = (0.0f64, 0.0f64, 0.0f64);
        let (mut bx, mut by) = (0.0f64, 0.0f64);
        for dy in -half_window..=half_window {
            for dx in -half_window..=half_window {
                let x = p.x + dx as f32;
                let y = p.y + dy as f32;
                if x < 1.0 || y < 1.0 || x > max_x || y > max_y {
                    continue;
                }
                let gx = 0.5 * (sample(image, x + 1.0, y) - sample(image, x - 1.0, y)) as f64;
                let gy = 0.5 * (sample(image, x, y + 1.0) - sample(image, x, y - 1.0)) as f64;
                let weight = (-((dx * dx + dy * dy) as f64) / (2.0 * sigma2)).exp();
                let (a, b, c) = (gx * gx * weight, gx * gy * weight, gy * gy * weight);
                gxx += a;
                gxy += b;
                gyy += c;
                bx += a * x as f64 + b * y as f64;
                by += b * x as f64 + c * y as f64;
            }
        }
        let det = gxx * gyy - gxy * gxy;
        if det.abs() < 1e-9 {
            break;
        }
        let next = Vec2::new(
            ((gyy * bx - gxy * by) / det) as f32,
            ((gxx * by - gxy * bx) / det) as f32,
        );
        let step = next.distance(p);
        p = next;
        if !p.is_finite() || step < 0.01 {
            break;
        }
    }
    if !p.is_finite() || p.distance(corner) > half_window as f32 {
        corner
    } else {
        p
    }
}
