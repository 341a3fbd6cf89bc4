mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camera_calibration_capture::*;
use common::*;

type Outcomes = Arc<Mutex<Vec<Result<CalibrationOutcome, SolveError>>>>;

/// Solver that blocks until released through a channel.
struct GatedSolver {
    release: Mutex<Receiver<()>>,
    entered: AtomicBool,
    inner: CountingSolver,
}

impl GatedSolver {
    fn new(release: Receiver<()>) -> GatedSolver {
        GatedSolver {
            release: Mutex::new(release),
            entered: AtomicBool::new(false),
            inner: CountingSolver::default(),
        }
    }

    fn entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }
}

impl CalibrationSolver for GatedSolver {
    fn solve(
        &self,
        sets: &[CapturedSet],
        pattern: &PatternSpec,
        image_size: (u32, u32),
    ) -> Result<CalibrationOutcome, SolveError> {
        self.entered.store(true, Ordering::SeqCst);
        let _ = self.release.lock().unwrap().recv();
        self.inner.solve(sets, pattern, image_size)
    }
}

struct Harness {
    session: Arc<CalibrationSession>,
    source: LiveSource,
    flow: FlowController,
    outcomes: Outcomes,
    next_time: i64,
}

impl Harness {
    fn new(max_count: usize, solver: CountingSolver, options: FlowOptions) -> Harness {
        Harness::with_solver(max_count, Arc::new(solver), options)
    }

    fn with_solver(
        max_count: usize,
        solver: Arc<dyn CalibrationSolver>,
        options: FlowOptions,
    ) -> Harness {
        let session = Arc::new(
            CalibrationSession::new(
                chessboard_config(max_count),
                (WIDTH, HEIGHT),
                Arc::new(ScriptedDetector::default()),
                solver,
            )
            .unwrap(),
        );
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let callback: FlowCallback = Box::new(move |result: &Result<CalibrationOutcome, SolveError>| {
            sink.lock().unwrap().push(result.clone())
        });
        let flow = FlowController::start_with_options(session.clone(), callback, options).unwrap();
        assert_eq!(flow.state(), FlowState::Welcome);
        Harness {
            session,
            source: LiveSource::new(WIDTH, HEIGHT),
            flow,
            outcomes,
            next_time: 1000,
        }
    }

    fn begin(&self) {
        assert!(self.flow.handle_event(FlowEvent::Touch));
        assert!(wait_until(|| self.flow.state() == FlowState::Capturing));
    }

    /// Shows a frame with the pattern in view and waits for its detection.
    fn present_pattern(&mut self) {
        let time_ns = self.next_time;
        self.next_time += 1000;
        self.source.show(time_ns, (time_ns / 1000) as u8);
        assert!(pump_until_published(&self.session, &mut self.source, time_ns));
    }

    fn capture_view(&mut self) {
        let before = self.session.captured_count();
        self.present_pattern();
        assert!(self.flow.handle_event(FlowEvent::Touch));
        assert!(wait_until(|| self.session.captured_count() == before + 1));
    }

    fn outcome_count(&self) -> usize {
        self.outcomes.lock().unwrap().len()
    }
}

#[test]
fn test_full_run_calibrates_once() {
    let mut h = Harness::new(3, CountingSolver::default(), FlowOptions::default());
    h.begin();
    assert!(wait_until(|| h.flow.status() == "Capturing image 1/3"));

    h.capture_view();
    h.capture_view();
    assert!(wait_until(|| h.flow.status() == "Capturing image 3/3"));

    h.present_pattern();
    assert!(h.flow.handle_event(FlowEvent::Touch));
    assert!(wait_until(|| h.flow.state() == FlowState::Done));

    assert_eq!(h.outcome_count(), 1);
    let outcome = h.outcomes.lock().unwrap()[0].clone().unwrap();
    assert_eq!(outcome.view_count, 3);
    assert_eq!(h.session.captured_count(), 0);
    assert!(h.flow.status().starts_with("Camera parameters calculated"));

    assert!(h.flow.handle_event(FlowEvent::Touch));
    assert!(wait_until(|| h.flow.state() == FlowState::Welcome));
    assert_eq!(h.outcome_count(), 1);
}

#[test]
fn test_calibrating_ignores_input() {
    let (release_tx, release_rx) = mpsc::channel();
    let solver = Arc::new(GatedSolver::new(release_rx));
    let mut h = Harness::with_solver(1, solver.clone(), FlowOptions::default());
    h.begin();
    h.present_pattern();
    assert!(h.flow.handle_event(FlowEvent::Touch));

    assert!(wait_until(|| h.flow.state() == FlowState::Calibrating));
    assert!(wait_until(|| solver.entered()));
    assert_eq!(h.flow.status(), "Calculating camera parameters...");
    assert!(!h.flow.handle_event(FlowEvent::Touch));
    assert!(!h.flow.handle_event(FlowEvent::BackButton));
    assert!(!h.flow.handle_event(FlowEvent::Modal));
    assert_eq!(h.flow.state(), FlowState::Calibrating);
    assert_eq!(h.outcome_count(), 0);

    release_tx.send(()).unwrap();
    assert!(wait_until(|| h.flow.state() == FlowState::Done));
    assert_eq!(h.outcome_count(), 1);
    assert_eq!(solver.inner.calls(), 1);
    // nothing posted during the solve survives into DONE
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(h.flow.state(), FlowState::Done);
}

#[test]
fn test_touch_without_detection_captures_nothing() {
    let h = Harness::new(3, CountingSolver::default(), FlowOptions::default());
    h.begin();
    assert!(h.flow.handle_event(FlowEvent::Touch));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.session.captured_count(), 0);
    assert_eq!(h.flow.state(), FlowState::Capturing);
}

#[test]
fn test_back_without_captures_cancels() {
    let h = Harness::new(3, CountingSolver::default(), FlowOptions::default());
    h.begin();
    assert!(h.flow.handle_event(FlowEvent::BackButton));
    assert!(wait_until(|| h.flow.state() == FlowState::Done));
    assert_eq!(h.flow.status(), "Calibration canceled");
    // the solver never ran
    assert_eq!(h.outcome_count(), 0);

    assert!(!h.flow.handle_event(FlowEvent::BackButton));
    assert!(h.flow.handle_event(FlowEvent::Touch));
    assert!(wait_until(|| h.flow.state() == FlowState::Welcome));
    assert_eq!(h.outcome_count(), 0);
}

#[test]
fn test_back_without_captures_returns_to_welcome() {
    let options = FlowOptions {
        acknowledge_cancel: false,
    };
    let h = Harness::new(3, CountingSolver::default(), options);
    h.begin();
    assert!(h.flow.handle_event(FlowEvent::BackButton));
    assert!(wait_until(|| h.flow.state() == FlowState::Welcome));
    assert_eq!(h.outcome_count(), 0);
    assert_eq!(h.session.captured_count(), 0);
}

#[test]
fn test_back_undoes_then_cancels() {
    let mut h = Harness::new(5, CountingSolver::default(), FlowOptions::default());
    h.begin();
    h.capture_view();
    h.capture_view();

    assert!(h.flow.handle_event(FlowEvent::BackButton));
    assert!(wait_until(|| h.session.captured_count() == 1));
    assert!(wait_until(|| h.flow.status() == "Capturing image 2/5"));
    assert_eq!(h.flow.state(), FlowState::Capturing);

    assert!(h.flow.handle_event(FlowEvent::BackButton));
    assert!(wait_until(|| h.flow.state() == FlowState::Done));
    assert_eq!(h.session.captured_count(), 0);
    assert_eq!(h.outcome_count(), 0);
}

#[test]
fn test_back_after_new_capture_only_undoes() {
    let mut h = Harness::new(5, CountingSolver::default(), FlowOptions::default());
    h.begin();
    h.capture_view();
    h.capture_view();
    assert!(h.flow.handle_event(FlowEvent::BackButton));
    assert!(wait_until(|| h.session.captured_count() == 1));

    h.capture_view();
    assert!(h.flow.handle_event(FlowEvent::BackButton));
    assert!(wait_until(|| h.session.captured_count() == 1));
    assert_eq!(h.flow.state(), FlowState::Capturing);
}

#[test]
fn test_solver_failure_still_finishes() {
    let mut h = Harness::new(1, CountingSolver::failing(), FlowOptions::default());
    h.begin();
    h.present_pattern();
    assert!(h.flow.handle_event(FlowEvent::Touch));
    assert!(wait_until(|| h.flow.state() == FlowState::Done));

    assert_eq!(h.outcome_count(), 1);
    assert!(h.outcomes.lock().unwrap()[0].is_err());
    assert!(h.flow.status().starts_with("Calibration failed"));
    assert_eq!(h.session.captured_count(), 0);
}

#[test]
fn test_second_run_after_done() {
    let mut h = Harness::new(1, CountingSolver::default(), FlowOptions::default());
    for run in 1..=2 {
        h.begin();
        h.present_pattern();
        assert!(h.flow.handle_event(FlowEvent::Touch));
        assert!(wait_until(|| h.flow.state() == FlowState::Done));
        assert_eq!(h.outcome_count(), run);
        assert!(h.flow.handle_event(FlowEvent::Touch));
        assert!(wait_until(|| h.flow.state() == FlowState::Welcome));
    }
}

#[test]
fn test_modal_blocks_touch() {
    let h = Harness::new(3, CountingSolver::default(), FlowOptions::default());
    assert!(!h.flow.handle_event(FlowEvent::BackButton));
    assert!(h.flow.handle_event(FlowEvent::Modal));
    std::thread::sleep(Duration::from_millis(50));
    assert!(!h.flow.handle_event(FlowEvent::Touch));
    assert_eq!(h.flow.state(), FlowState::Welcome);

    assert!(h.flow.handle_event(FlowEvent::Modal));
    assert!(wait_until(|| h.flow.handle_event(FlowEvent::Touch)));
    assert!(wait_until(|| h.flow.state() == FlowState::Capturing));
}

#[test]
fn test_stop() {
    let mut h = Harness::new(3, CountingSolver::default(), FlowOptions::default());
    h.begin();
    assert!(h.flow.stop());
    assert_eq!(h.flow.state(), FlowState::NotInited);
    assert!(!h.flow.handle_event(FlowEvent::Touch));
    assert!(!h.flow.stop());
    assert_eq!(h.outcome_count(), 0);
}

#[test]
fn test_stop_from_welcome_and_drop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let session = new_session(
        2,
        Arc::new(ScriptedDetector::default()),
        Arc::new(CountingSolver::default()),
    );
    let callback: FlowCallback = Box::new(move |_: &Result<CalibrationOutcome, SolveError>| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let flow = FlowController::start(session.clone(), callback).unwrap();
    assert_eq!(flow.state(), FlowState::Welcome);
    drop(flow);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(Arc::strong_count(&session), 1);
}
