use glam::Vec2;
use log::{debug, info};
use nalgebra as na;
use rayon::prelude::*;

use crate::error::SolveError;
use crate::types::{CalibrationOutcome, CameraParams, CapturedSet, PatternSpec};

/// Boundary to the calibration solver.
///
/// Called synchronously from the flow thread; may block for a long time.
pub trait CalibrationSolver: Send + Sync {
    fn solve(
        &self,
        sets: &[CapturedSet],
        pattern: &PatternSpec,
        image_size: (u32, u32),
    ) -> Result<CalibrationOutcome, SolveError>;
}

/// Pinhole focal estimate from planar homographies.
///
/// The principal point is fixed at the image centre and pixels are square.
/// Each view's error is the mean distance between the observed corners and
/// the board points mapped through that view's homography.
#[derive(Debug, Default, Clone, Copy)]
pub struct HomographySolver;

struct ViewFit {
    focal: Option<f64>,
    mean_error: f64,
}

fn normalization(points: &[na::Vector2<f64>]) -> na::Matrix3<f64> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(na::Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let s = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    na::Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    )
}

fn transform(t: &na::Matrix3<f64>, p: &na::Vector2<f64>) -> na::Vector2<f64> {
    let r = t * na::Vector3::new(p.x, p.y, 1.0);
    na::Vector2::new(r.x / r.z, r.y / r.z)
}

/// Normalised DLT estimate of the homography mapping `src` onto `dst`.
pub fn find_homography(
    src: &[na::Vector2<f64>],
    dst: &[na::Vector2<f64>],
) -> Option<na::Matrix3<f64>> {
    if src.len() < 4 || src.len() != dst.len() {
        return None;
    }
    let t_src = normalization(src);
    let t_dst = normalization(dst);
    let mut a = na::DMatrix::<f64>::zeros(src.len() * 2, 9);
    for (i, (p, q)) in src.iter().zip(dst).enumerate() {
        let p = transform(&t_src, p);
        let q = transform(&t_dst, q);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -p.x;
        a[(r0, 1)] = -p.y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = q.x * p.x;
        a[(r0, 7)] = q.x * p.y;
        a[(r0, 8)] = q.x;
        a[(r1, 3)] = -p.x;
        a[(r1, 4)] = -p.y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = q.y * p.x;
        a[(r1, 7)] = q.y * p.y;
        a[(r1, 8)] = q.y;
    }
    let ata = a.transpose() * &a;
    let eig = ata.symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|l, r| l.1.total_cmp(r.1))?;
    let h = eig.eigenvectors.column(min_idx);
    let h_norm = na::Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let t_dst_inv = t_dst.try_inverse()?;
    let h_mat = t_dst_inv * h_norm * t_src;
    if h_mat[(2, 2)].abs() > f64::EPSILON {
        Some(h_mat / h_mat[(2, 2)])
    } else {
        Some(h_mat)
    }
}

/// Focal length from a board-to-image homography whose image side is
/// centred on the principal point.
///
/// Uses the orthogonality and equal-norm constraints on the first two
/// rotation columns; fronto-parallel views give no estimate.
pub fn homography_to_focal(h_mat: &na::Matrix3<f64>) -> Option<f64> {
    let h0 = h_mat[(0, 0)];
    let h1 = h_mat[(0, 1)];
    let h3 = h_mat[(1, 0)];
    let h4 = h_mat[(1, 1)];
    let h6 = h_mat[(2, 0)];
    let h7 = h_mat[(2, 1)];

    let d1 = h6 * h7;
    let d2 = (h7 - h6) * (h7 + h6);
    let v1 = if d1.abs() > f64::EPSILON {
        -(h0 * h1 + h3 * h4) / d1
    } else {
        f64::NAN
    };
    let v2 = if d2.abs() > f64::EPSILON {
        (h0 * h0 + h3 * h3 - h1 * h1 - h4 * h4) / d2
    } else {
        f64::NAN
    };
    match (v1 > 0.0, v2 > 0.0) {
        (true, true) => {
            if d1.abs() > d2.abs() {
                Some(v1.sqrt())
            } else {
                Some(v2.sqrt())
            }
        }
        (true, false) => Some(v1.sqrt()),
        (false, true) => Some(v2.sqrt()),
        (false, false) => None,
    }
}

fn fit_view(
    object: &[na::Vector2<f64>],
    corners: &[Vec2],
    principal: na::Vector2<f64>,
) -> Option<ViewFit> {
    let image: Vec<_> = corners
        .iter()
        .map(|p| na::Vector2::new(p.x as f64, p.y as f64))
        .collect();
    let h_mat = find_homography(object, &image)?;
    let mean_error = object
        .iter()
        .zip(&image)
        .map(|(o, p)| (transform(&h_mat, o) - p).norm())
        .sum::<f64>()
        / object.len() as f64;
    let centre = na::Matrix3::new(
        1.0,
        0.0,
        -principal.x,
        0.0,
        1.0,
        -principal.y,
        0.0,
        0.0,
        1.0,
    );
    Some(ViewFit {
        focal: homography_to_focal(&(centre * h_mat)),
        mean_error,
    })
}

impl CalibrationSolver for HomographySolver {
    fn solve(
        &self,
        sets: &[CapturedSet],
        pattern: &PatternSpec,
        image_size: (u32, u32),
    ) -> Result<CalibrationOutcome, SolveError> {
        if sets.is_empty() {
            return Err(SolveError::NoViews);
        }
        let expected = pattern.expected_corner_count();
        if let Some((view, set)) = sets
            .iter()
            .enumerate()
            .find(|(_, s)| s.corners.len() != expected)
        {
            return Err(SolveError::PointCountMismatch {
                view,
                expected,
                actual: set.corners.len(),
            });
        }
        let object: Vec<_> = pattern
            .object_points()
            .iter()
            .map(|p| na::Vector2::new(p.x as f64, p.y as f64))
            .collect();
        let principal = na::Vector2::new(image_size.0 as f64 / 2.0, image_size.1 as f64 / 2.0);
        info!("solving from {} views", sets.len());

        let fits: Vec<_> = sets
            .par_iter()
            .map(|set| fit_view(&object, &set.corners, principal))
            .collect();
        let fits: Vec<ViewFit> = fits
            .into_iter()
            .enumerate()
            .map(|(i, fit)| {
                fit.ok_or_else(|| SolveError::Degenerate(format!("no homography for view {}", i)))
            })
            .collect::<Result<_, _>>()?;

        let mut focals: Vec<f64> = fits.iter().filter_map(|f| f.focal).collect();
        debug!("focal estimates {:?}", focals);
        if focals.is_empty() {
            return Err(SolveError::Degenerate(
                "no view constrains the focal length".to_string(),
            ));
        }
        focals.sort_by(|a, b| a.total_cmp(b));
        let mid = focals.len() / 2;
        let focal = if focals.len() % 2 == 0 {
            (focals[mid - 1] + focals[mid]) / 2.0
        } else {
            focals[mid]
        };

        let errors: Vec<f64> = fits.iter().map(|f| f.mean_error).collect();
        let err_min = errors.iter().copied().fold(f64::INFINITY, f64::min);
        let err_max = errors.iter().copied().fold(0.0, f64::max);
        let err_avg = errors.iter().sum::<f64>() / errors.len() as f64;

        Ok(CalibrationOutcome {
            params: CameraParams {
                width: image_size.0,
                height: image_size.1,
                fx: focal,
                fy: focal,
                cx: principal.x,
                cy: principal.y,
            },
            err_min,
            err_avg,
            err_max,
            view_count: sets.len(),
        })
    }
}
