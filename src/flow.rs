//! Capture flow: welcome, capturing, calibrating, done.
//!
//! The controller runs on its own thread and blocks on a one-deep event
//! mailbox. Input events that fall outside the active mask are dropped, and
//! an unconsumed event is overwritten by the next one, so rapid input
//! collapses to the latest event instead of queueing up.

use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, trace};

use crate::error::SolveError;
use crate::session::CalibrationSession;
use crate::types::CalibrationOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    NotInited,
    Welcome,
    Capturing,
    Calibrating,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowEvent {
    None,
    Touch,
    BackButton,
    Modal,
}

impl FlowEvent {
    fn bits(self) -> u8 {
        match self {
            FlowEvent::None => 0,
            FlowEvent::Touch => 1,
            FlowEvent::BackButton => 2,
            FlowEvent::Modal => 4,
        }
    }
}

/// Set of events the controller currently accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const TOUCH: EventMask = EventMask(1);
    pub const BACK_BUTTON: EventMask = EventMask(2);
    pub const MODAL: EventMask = EventMask(4);

    pub fn accepts(self, event: FlowEvent) -> bool {
        self.0 & event.bits() != 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl From<FlowEvent> for EventMask {
    fn from(event: FlowEvent) -> EventMask {
        EventMask(event.bits())
    }
}

struct MailboxState {
    pending: Option<FlowEvent>,
    mask: EventMask,
    stop: bool,
}

/// Single-slot event holder with a wake-up on post or stop.
pub struct EventMailbox {
    inner: Mutex<MailboxState>,
    cond: Condvar,
}

impl Default for EventMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMailbox {
    pub fn new() -> EventMailbox {
        EventMailbox {
            inner: Mutex::new(MailboxState {
                pending: None,
                mask: EventMask::NONE,
                stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a new mask, dropping a pending event the mask no longer
    /// accepts.
    pub fn set_mask(&self, mask: EventMask) {
        let mut state = self.lock();
        state.mask = mask;
        if state.pending.is_some_and(|e| !mask.accepts(e)) {
            state.pending = None;
        }
    }

    /// Stores `event` if the mask accepts it, replacing any unconsumed one.
    pub fn post(&self, event: FlowEvent) -> bool {
        let mut state = self.lock();
        if !state.mask.accepts(event) {
            trace!("discarding {:?}, mask {:?}", event, state.mask);
            return false;
        }
        state.pending = Some(event);
        self.cond.notify_all();
        true
    }

    /// Blocks until an event arrives; `None` once a stop was requested.
    pub fn wait(&self) -> Option<FlowEvent> {
        let mut state = self.lock();
        loop {
            if state.stop {
                return None;
            }
            if let Some(event) = state.pending.take() {
                return Some(event);
            }
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_take(&self) -> Option<FlowEvent> {
        self.lock().pending.take()
    }

    pub fn request_stop(&self) {
        self.lock().stop = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stop
    }
}

/// Called once per finished (not cancelled) capture run.
///
/// Runs on the flow thread: the next run cannot start until it returns, so
/// slow persistence should be handed off.
pub type FlowCallback = Box<dyn FnMut(&Result<CalibrationOutcome, SolveError>) + Send>;

#[derive(Debug, Clone, Copy)]
pub struct FlowOptions {
    /// A cancelled run shows DONE and waits for a dismissing touch before
    /// returning to WELCOME.
    pub acknowledge_cancel: bool,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            acknowledge_cancel: true,
        }
    }
}

struct FlowShared {
    state: Mutex<FlowState>,
    status: Mutex<String>,
    mailbox: EventMailbox,
    running: AtomicBool,
}

impl FlowShared {
    fn state(&self) -> FlowState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: FlowState) {
        debug!("flow state {:?}", state);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_status(&self, message: &str) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.clear();
        status.push_str(message);
    }

    /// Mask first, so whoever sees the new state can post straight away.
    fn enter(&self, mask: EventMask, state: FlowState) {
        self.mailbox.set_mask(mask);
        self.set_state(state);
    }
}

enum CaptureExit {
    Complete,
    Cancelled,
    Stopped,
}

struct FlowRunner {
    shared: Arc<FlowShared>,
    session: Arc<CalibrationSession>,
    callback: FlowCallback,
    options: FlowOptions,
    ready: Option<Sender<()>>,
}

impl FlowRunner {
    fn run(mut self) {
        info!("start flow thread");
        let mut first = true;
        while !self.shared.mailbox.is_stopped() {
            if first {
                info!("Welcome to the camera calibrator. Touch to begin a calibration run.");
                first = false;
            } else {
                info!("Touch to begin a calibration run.");
            }
            self.shared
                .enter(EventMask::TOUCH | EventMask::MODAL, FlowState::Welcome);
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(());
            }
            let Some(event) = self.shared.mailbox.wait() else {
                break;
            };
            if event == FlowEvent::Modal {
                self.shared.mailbox.set_mask(EventMask::MODAL);
                if self.shared.mailbox.wait().is_none() {
                    break;
                }
                continue;
            }

            let keep_going = match self.capture_loop() {
                CaptureExit::Stopped => false,
                CaptureExit::Cancelled => self.cancelled(),
                CaptureExit::Complete => self.calibrate(),
            };
            if !keep_going {
                break;
            }
        }
        self.shared.set_status("");
        info!("end flow thread");
    }

    fn capture_loop(&mut self) -> CaptureExit {
        let mut captured_since_back = false;
        self.shared.enter(
            EventMask::TOUCH | EventMask::BACK_BUTTON,
            FlowState::Capturing,
        );
        while self.session.captured_count() < self.session.max_count() {
            let message = format!(
                "Capturing image {}/{}",
                self.session.captured_count() + 1,
                self.session.max_count()
            );
            info!("{}", message);
            self.shared.set_status(&message);

            let Some(event) = self.shared.mailbox.wait() else {
                return CaptureExit::Stopped;
            };
            match event {
                FlowEvent::Touch => {
                    if self.session.capture() {
                        captured_since_back = true;
                    }
                }
                FlowEvent::BackButton => {
                    if !captured_since_back {
                        self.session.uncapture_all();
                        return CaptureExit::Cancelled;
                    }
                    self.session.uncapture();
                    captured_since_back = false;
                }
                _ => {}
            }
        }
        CaptureExit::Complete
    }

    fn cancelled(&mut self) -> bool {
        info!("Calibration canceled");
        if !self.options.acknowledge_cancel {
            self.shared.set_status("");
            return true;
        }
        self.shared.set_status("Calibration canceled");
        self.shared.enter(EventMask::TOUCH, FlowState::Done);
        self.shared.mailbox.wait().is_some()
    }

    fn calibrate(&mut self) -> bool {
        self.shared.enter(EventMask::NONE, FlowState::Calibrating);
        self.shared.set_status("Calculating camera parameters...");
        let result = self.session.compute_calibration();
        (self.callback)(&result);
        self.session.uncapture_all();

        let message = match &result {
            Ok(outcome) => format!(
                "Camera parameters calculated (error min={:.3}, avg={:.3}, max={:.3})",
                outcome.err_min, outcome.err_avg, outcome.err_max
            ),
            Err(e) => format!("Calibration failed: {}", e),
        };
        self.shared.set_status(&message);
        self.shared.enter(EventMask::TOUCH, FlowState::Done);
        self.shared.mailbox.wait().is_some()
    }
}

/// Drives a `CalibrationSession` from operator input on a dedicated thread.
pub struct FlowController {
    shared: Arc<FlowShared>,
    handle: Option<JoinHandle<()>>,
}

impl FlowController {
    pub fn start(
        session: Arc<CalibrationSession>,
        callback: FlowCallback,
    ) -> std::io::Result<FlowController> {
        Self::start_with_options(session, callback, FlowOptions::default())
    }

    /// Returns once the flow thread has entered WELCOME.
    pub fn start_with_options(
        session: Arc<CalibrationSession>,
        callback: FlowCallback,
        options: FlowOptions,
    ) -> std::io::Result<FlowController> {
        let shared = Arc::new(FlowShared {
            state: Mutex::new(FlowState::NotInited),
            status: Mutex::new(String::new()),
            mailbox: EventMailbox::new(),
            running: AtomicBool::new(true),
        });
        let (ready_tx, ready_rx) = mpsc::channel();
        let runner = FlowRunner {
            shared: Arc::clone(&shared),
            session,
            callback,
            options,
            ready: Some(ready_tx),
        };
        let handle = thread::Builder::new()
            .name("flow".to_string())
            .spawn(move || runner.run())?;
        if ready_rx.recv().is_err() {
            error!("flow thread exited before reaching WELCOME");
        }
        Ok(FlowController {
            shared,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> FlowState {
        if !self.shared.running.load(Ordering::Acquire) {
            return FlowState::NotInited;
        }
        self.shared.state()
    }

    /// Current status line, empty when there is nothing to show.
    pub fn status(&self) -> String {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Posts an operator event. Returns `false` when the event is discarded.
    pub fn handle_event(&self, event: FlowEvent) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        self.shared.mailbox.post(event)
    }

    /// Stops the flow thread and waits for it.
    ///
    /// Returns promptly from any event wait; a solve already in progress
    /// runs to completion first.
    pub fn stop(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        debug!("waiting for flow thread to exit");
        self.shared.mailbox.request_stop();
        if handle.join().is_err() {
            error!("flow thread panicked");
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.set_state(FlowState::NotInited);
        true
    }
}

impl Drop for FlowController {
    fn drop(&mut self) {
        self.stop();
    }
}
