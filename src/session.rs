use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::GrayImage;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::detector::FeatureDetector;
use crate::error::{ConfigError, FrameError, SolveError};
use crate::result_buffer::ResultBuffer;
use crate::solver::CalibrationSolver;
use crate::source::{FrameSource, VideoFrame};
use crate::types::{CalibrationOutcome, CapturedSet, PatternSpec, PatternType};
use crate::worker::{CornerFinderWorker, DetectionJob, WorkerBusy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub pattern: PatternSpec,
    /// Number of views to capture before calibrating.
    pub max_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pattern: PatternSpec::default(),
            max_count: 10,
        }
    }
}

/// What one `submit_frame` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCycle {
    /// A finished detection was moved into the result buffer.
    pub published: bool,
    /// A new frame was copied and handed to the corner finder.
    pub submitted: bool,
    /// The corner finder was still busy, so no frame was taken.
    pub skipped: bool,
}

struct Pump {
    worker: CornerFinderWorker,
    /// `None` while the buffer is travelling with a job.
    frame: Option<GrayImage>,
    last_time_ns: Option<i64>,
}

/// One calibration capture session.
///
/// Shared between the frame pump (`submit_frame`), the flow thread
/// (capture and compute) and display readers (`results`).
pub struct CalibrationSession {
    config: SessionConfig,
    frame_size: (u32, u32),
    detector: Arc<dyn FeatureDetector>,
    solver: Arc<dyn CalibrationSolver>,
    pump: Mutex<Pump>,
    results: ResultBuffer,
    captured: Mutex<Vec<CapturedSet>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn copy_frame(frame: &VideoFrame<'_>, buffer: &mut GrayImage) -> Result<(), FrameError> {
    if (frame.width, frame.height) != buffer.dimensions() {
        return Err(FrameError::SizeMismatch {
            expected: buffer.dimensions(),
            actual: (frame.width, frame.height),
        });
    }
    if frame.luma.len() != buffer.len() {
        return Err(FrameError::ByteLength {
            expected: buffer.len(),
            actual: frame.luma.len(),
        });
    }
    buffer.copy_from_slice(frame.luma);
    Ok(())
}

impl CalibrationSession {
    pub fn new(
        config: SessionConfig,
        frame_size: (u32, u32),
        detector: Arc<dyn FeatureDetector>,
        solver: Arc<dyn CalibrationSolver>,
    ) -> Result<CalibrationSession, ConfigError> {
        let (width, height) = frame_size;
        if width == 0 || height == 0 {
            return Err(ConfigError::InvalidFrameSize { width, height });
        }
        if config.max_count == 0 {
            return Err(ConfigError::InvalidMaxCount);
        }
        let pattern = config.pattern;
        let min_side = match pattern.pattern_type {
            PatternType::AprilGrid => 1,
            _ => 2,
        };
        if pattern.cols < min_side || pattern.rows < min_side {
            return Err(ConfigError::InvalidPatternSize {
                cols: pattern.cols,
                rows: pattern.rows,
            });
        }
        let worker = CornerFinderWorker::spawn(Arc::clone(&detector), pattern)?;
        info!(
            "calibration session: {:?} {}x{}, {} views, {}x{} frames",
            pattern.pattern_type, pattern.cols, pattern.rows, config.max_count, width, height
        );
        Ok(CalibrationSession {
            config,
            frame_size,
            detector,
            solver,
            pump: Mutex::new(Pump {
                worker,
                frame: Some(GrayImage::new(width, height)),
                last_time_ns: None,
            }),
            results: ResultBuffer::new(width, height),
            captured: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    /// Latest published detection, for display.
    pub fn results(&self) -> &ResultBuffer {
        &self.results
    }

    /// One frame-pump cycle.
    ///
    /// Publishes a finished detection, then, if the corner finder is idle and
    /// the source has a newer frame, copies it and starts a new detection.
    /// Frames arriving while the corner finder is busy are dropped.
    pub fn submit_frame(&self, source: &mut dyn FrameSource) -> Result<FrameCycle, FrameError> {
        let mut pump = lock(&self.pump);
        let mut cycle = FrameCycle::default();

        if pump.worker.is_complete() {
            if let Some(done) = pump.worker.await_completion() {
                self.results.publish(
                    done.detection.found,
                    &done.detection.corners,
                    &done.job.frame,
                    done.job.time_ns,
                );
                pump.frame = Some(done.job.frame);
                cycle.published = true;
            }
        }

        if pump.worker.is_busy() {
            cycle.skipped = true;
            return Ok(cycle);
        }
        let Some(mut buffer) = pump.frame.take() else {
            return Ok(cycle);
        };

        let copied = match source.checkout_frame_if_newer_than(pump.last_time_ns) {
            Some(frame) => Some(copy_frame(&frame, &mut buffer).map(|_| frame.time_ns)),
            None => None,
        };
        if copied.is_some() {
            source.checkin_frame();
        }
        match copied {
            None => {
                pump.frame = Some(buffer);
                Ok(cycle)
            }
            Some(Err(e)) => {
                pump.frame = Some(buffer);
                Err(e)
            }
            Some(Ok(time_ns)) => {
                pump.last_time_ns = Some(time_ns);
                let job = DetectionJob {
                    frame: buffer,
                    time_ns,
                };
                match pump.worker.submit(job) {
                    Ok(()) => cycle.submitted = true,
                    Err(WorkerBusy(job)) => pump.frame = Some(job.frame),
                }
                Ok(cycle)
            }
        }
    }

    /// Keeps the latest result as a calibration view.
    ///
    /// Fails without side effects when the session is full or the latest
    /// result is not a complete detection.
    pub fn capture(&self) -> bool {
        let mut captured = lock(&self.captured);
        if captured.len() >= self.config.max_count {
            return false;
        }
        let view = self.results.lock_and_fetch();
        if !view.found {
            return false;
        }
        let corners = self
            .detector
            .refine_corners(view.frame(), &view.corners, &self.config.pattern);
        let time_ns = view.time_ns();
        view.unlock();

        captured.push(CapturedSet { time_ns, corners });
        info!("---------- {:2}/{:2} -----------", captured.len(), self.config.max_count);
        if let Some(set) = captured.last() {
            for p in &set.corners {
                debug!("  {:.3}, {:.3}", p.x, p.y);
            }
        }
        true
    }

    /// Drops the most recent view.
    pub fn uncapture(&self) -> bool {
        lock(&self.captured).pop().is_some()
    }

    /// Drops every view.
    pub fn uncapture_all(&self) -> bool {
        let mut captured = lock(&self.captured);
        if captured.is_empty() {
            return false;
        }
        captured.clear();
        true
    }

    pub fn captured_count(&self) -> usize {
        lock(&self.captured).len()
    }

    pub fn max_count(&self) -> usize {
        self.config.max_count
    }

    /// Copy of the captured views, oldest first.
    pub fn captured_sets(&self) -> Vec<CapturedSet> {
        lock(&self.captured).clone()
    }

    /// Runs the solver over every captured view. Blocks for the whole solve.
    pub fn compute_calibration(&self) -> Result<CalibrationOutcome, SolveError> {
        let sets = self.captured_sets();
        info!("calculating camera parameters from {} views", sets.len());
        let result = self
            .solver
            .solve(&sets, &self.config.pattern, self.frame_size);
        match &result {
            Ok(outcome) => info!(
                "camera parameters calculated (error min={:.3}, avg={:.3}, max={:.3})",
                outcome.err_min, outcome.err_avg, outcome.err_max
            ),
            Err(e) => error!("calibration failed: {}", e),
        }
        result
    }
}
