//! Background corner finder.
//!
//! One dedicated thread runs the detector on a submitted frame while the
//! frame pump keeps going. The frame buffer moves into the worker with the
//! job and comes back with the result, so nobody else can touch it while a
//! detection is in flight.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use image::GrayImage;
use log::{error, info};

use crate::detector::{Detection, FeatureDetector};
use crate::error::ConfigError;
use crate::types::PatternSpec;

#[derive(Debug)]
pub struct DetectionJob {
    pub frame: GrayImage,
    pub time_ns: i64,
}

#[derive(Debug)]
pub struct CompletedJob {
    pub job: DetectionJob,
    pub detection: Detection,
}

/// Returned by `submit` when a job is already in flight; hands the job back.
#[derive(thiserror::Error, Debug)]
#[error("corner finder is busy")]
pub struct WorkerBusy(pub DetectionJob);

enum Slot {
    Idle,
    Pending(DetectionJob),
    Running,
    Complete(CompletedJob),
}

struct WorkerState {
    slot: Slot,
    stop: bool,
}

struct Shared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, WorkerState>) -> MutexGuard<'a, WorkerState> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

fn take_pending(slot: &mut Slot) -> Option<DetectionJob> {
    match std::mem::replace(slot, Slot::Running) {
        Slot::Pending(job) => Some(job),
        other => {
            *slot = other;
            None
        }
    }
}

pub struct CornerFinderWorker {
    shared: Arc<Shared>,
    pattern: PatternSpec,
    handle: Option<JoinHandle<()>>,
}

impl CornerFinderWorker {
    /// Starts the worker thread for `pattern`.
    ///
    /// Fails if the detector cannot handle the pattern type, so an
    /// unsupported configuration never reaches a job.
    pub fn spawn(
        detector: Arc<dyn FeatureDetector>,
        pattern: PatternSpec,
    ) -> Result<CornerFinderWorker, ConfigError> {
        if !detector.supports(pattern.pattern_type) {
            return Err(ConfigError::UnsupportedPattern(pattern.pattern_type));
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState {
                slot: Slot::Idle,
                stop: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("corner-finder".to_string())
            .spawn(move || corner_finder(thread_shared, detector, pattern))
            .map_err(ConfigError::WorkerSpawn)?;
        Ok(CornerFinderWorker {
            shared,
            pattern,
            handle: Some(handle),
        })
    }

    pub fn pattern(&self) -> &PatternSpec {
        &self.pattern
    }

    /// Hands a job to the worker if it is idle. Never blocks.
    pub fn submit(&self, job: DetectionJob) -> Result<(), WorkerBusy> {
        let mut state = self.shared.lock();
        if state.stop || !matches!(state.slot, Slot::Idle) {
            return Err(WorkerBusy(job));
        }
        state.slot = Slot::Pending(job);
        self.shared.cond.notify_all();
        Ok(())
    }

    /// A job is queued, running, or finished but not yet collected.
    pub fn is_busy(&self) -> bool {
        !matches!(self.shared.lock().slot, Slot::Idle)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.shared.lock().slot, Slot::Complete(_))
    }

    /// Blocks until the in-flight job finishes, collects it and resets the
    /// worker to idle.
    ///
    /// Returns `None` when nothing was submitted or the worker is stopping.
    pub fn await_completion(&self) -> Option<CompletedJob> {
        let mut state = self.shared.lock();
        loop {
            match std::mem::replace(&mut state.slot, Slot::Idle) {
                Slot::Complete(done) => return Some(done),
                Slot::Idle => return None,
                other => {
                    state.slot = other;
                    if state.stop {
                        return None;
                    }
                    state = self.shared.wait(state);
                }
            }
        }
    }

    /// Asks the thread to exit once it is between jobs. A detection already
    /// running is not interrupted.
    pub fn request_stop(&self) {
        self.shared.lock().stop = true;
        self.shared.cond.notify_all();
    }
}

impl Drop for CornerFinderWorker {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("corner finder thread panicked");
            }
        }
    }
}

fn corner_finder(shared: Arc<Shared>, detector: Arc<dyn FeatureDetector>, pattern: PatternSpec) {
    info!("start corner finder thread");
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.stop {
                    break None;
                }
                if let Some(job) = take_pending(&mut state.slot) {
                    break Some(job);
                }
                state = shared.wait(state);
            }
        };
        let Some(job) = job else {
            break;
        };
        let detection = detector.detect(&job.frame, &pattern);
        shared.lock().slot = Slot::Complete(CompletedJob { job, detection });
        shared.cond.notify_all();
    }
    info!("end corner finder thread");
}
