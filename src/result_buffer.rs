use std::sync::{Mutex, MutexGuard, PoisonError};

use glam::Vec2;
use image::GrayImage;

/// Snapshot of a finished detection, with the frame it ran on.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub found: bool,
    pub corners: Vec<Vec2>,
    pub frame: GrayImage,
    pub time_ns: i64,
}

/// Latest completed detection, shared between the pipeline and any display.
///
/// A reader holding a `ResultView` keeps the buffer locked; `publish` waits
/// for it to be released, so a reader never sees a half-written result.
pub struct ResultBuffer {
    inner: Mutex<DetectionResult>,
}

/// Locked access to the published result.
///
/// `found` and `corners` are copies taken at lock time; the frame is read in
/// place. Unlocks on `unlock` or drop.
pub struct ResultView<'a> {
    guard: MutexGuard<'a, DetectionResult>,
    pub found: bool,
    pub corners: Vec<Vec2>,
}

impl ResultView<'_> {
    pub fn frame(&self) -> &GrayImage {
        &self.guard.frame
    }

    pub fn time_ns(&self) -> i64 {
        self.guard.time_ns
    }

    pub fn unlock(self) {}
}

impl ResultBuffer {
    /// Empty result: nothing found, zeroed frame of the session size.
    pub fn new(width: u32, height: u32) -> ResultBuffer {
        ResultBuffer {
            inner: Mutex::new(DetectionResult {
                found: false,
                corners: Vec::new(),
                frame: GrayImage::new(width, height),
                time_ns: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DetectionResult> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the whole result under the lock. Pixels are copied into the
    /// existing frame buffer when the sizes agree.
    pub fn publish(&self, found: bool, corners: &[Vec2], frame: &GrayImage, time_ns: i64) {
        let mut result = self.lock();
        result.found = found;
        result.corners.clear();
        result.corners.extend_from_slice(corners);
        if result.frame.dimensions() == frame.dimensions() {
            result.frame.copy_from_slice(frame);
        } else {
            result.frame = frame.clone();
        }
        result.time_ns = time_ns;
    }

    pub fn lock_and_fetch(&self) -> ResultView<'_> {
        let guard = self.lock();
        let found = guard.found;
        let corners = guard.corners.clone();
        ResultView {
            guard,
            found,
            corners,
        }
    }

    /// Owned copy of the current result.
    pub fn snapshot(&self) -> DetectionResult {
        self.lock().clone()
    }
}
