#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use camera_calibration_capture::*;
use glam::Vec2;
use image::GrayImage;

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 24;
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Finds the pattern when the top-left pixel is non-zero. Corner positions
/// are derived from that pixel so results of different frames differ.
#[derive(Default)]
pub struct ScriptedDetector {
    pub delay: Duration,
    pub detect_calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn slow(delay: Duration) -> ScriptedDetector {
        ScriptedDetector {
            delay,
            ..Default::default()
        }
    }
}

pub fn scripted_corners(value: u8, pattern: &PatternSpec) -> Vec<Vec2> {
    (0..pattern.expected_corner_count())
        .map(|i| Vec2::new(i as f32 + value as f32, value as f32))
        .collect()
}

/// Offset `ScriptedDetector::refine_corners` applies.
pub const REFINE_OFFSET: f32 = 0.25;

impl FeatureDetector for ScriptedDetector {
    fn supports(&self, pattern_type: PatternType) -> bool {
        matches!(pattern_type, PatternType::Chessboard | PatternType::CirclesGrid)
    }

    fn detect(&self, image: &GrayImage, pattern: &PatternSpec) -> Detection {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let value = image.get_pixel(0, 0)[0];
        if value == 0 {
            return Detection::default();
        }
        Detection {
            found: true,
            corners: scripted_corners(value, pattern),
        }
    }

    fn refine_corners(&self, _image: &GrayImage, corners: &[Vec2], _pattern: &PatternSpec) -> Vec<Vec2> {
        corners.iter().map(|p| *p + Vec2::splat(REFINE_OFFSET)).collect()
    }
}

/// Solver that records its calls and either succeeds or fails.
#[derive(Default)]
pub struct CountingSolver {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl CountingSolver {
    pub fn failing() -> CountingSolver {
        CountingSolver {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CalibrationSolver for CountingSolver {
    fn solve(
        &self,
        sets: &[CapturedSet],
        _pattern: &PatternSpec,
        image_size: (u32, u32),
    ) -> Result<CalibrationOutcome, SolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SolveError::Degenerate("scripted failure".to_string()));
        }
        Ok(CalibrationOutcome {
            params: CameraParams {
                width: image_size.0,
                height: image_size.1,
                fx: 100.0,
                fy: 100.0,
                cx: image_size.0 as f64 / 2.0,
                cy: image_size.1 as f64 / 2.0,
            },
            err_min: 0.1,
            err_avg: 0.2,
            err_max: 0.3,
            view_count: sets.len(),
        })
    }
}

/// Camera stand-in showing one uniform frame at a time.
pub struct LiveSource {
    pub width: u32,
    pub height: u32,
    pub time_ns: Option<i64>,
    pub luma: Vec<u8>,
    pub checkouts: usize,
    pub checkins: usize,
}

impl LiveSource {
    pub fn new(width: u32, height: u32) -> LiveSource {
        LiveSource {
            width,
            height,
            time_ns: None,
            luma: vec![0; (width * height) as usize],
            checkouts: 0,
            checkins: 0,
        }
    }

    /// Replaces the current frame with one filled with `value`.
    pub fn show(&mut self, time_ns: i64, value: u8) {
        self.time_ns = Some(time_ns);
        self.luma.fill(value);
    }
}

impl FrameSource for LiveSource {
    fn checkout_frame_if_newer_than(&mut self, time_ns: Option<i64>) -> Option<VideoFrame<'_>> {
        let current = self.time_ns?;
        if time_ns.is_some_and(|since| current <= since) {
            return None;
        }
        self.checkouts += 1;
        Some(VideoFrame {
            time_ns: current,
            width: self.width,
            height: self.height,
            luma: &self.luma,
        })
    }

    fn checkin_frame(&mut self) {
        self.checkins += 1;
    }
}

pub fn chessboard_config(max_count: usize) -> SessionConfig {
    SessionConfig {
        pattern: PatternSpec {
            pattern_type: PatternType::Chessboard,
            cols: 4,
            rows: 3,
            spacing: 10.0,
            tag_spacing: 0.0,
        },
        max_count,
    }
}

pub fn new_session(
    max_count: usize,
    detector: Arc<ScriptedDetector>,
    solver: Arc<CountingSolver>,
) -> Arc<CalibrationSession> {
    Arc::new(
        CalibrationSession::new(chessboard_config(max_count), (WIDTH, HEIGHT), detector, solver)
            .unwrap(),
    )
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Runs the frame pump until the result for `time_ns` is published.
pub fn pump_until_published(session: &CalibrationSession, source: &mut LiveSource, time_ns: i64) -> bool {
    wait_until(|| {
        session.submit_frame(source).unwrap();
        session.results().lock_and_fetch().time_ns() == time_ns
    })
}
