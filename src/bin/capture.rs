use aprilgrid::TagFamily;
use camera_calibration_capture::io::{SaveOptions, object_from_json, save_outcome, write_report};
use camera_calibration_capture::queue::{QUEUE_DIR, UploadQueue};
use camera_calibration_capture::*;
use clap::Parser;
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(version, about, author)]
struct CCapCli {
    /// path to image folder
    path: String,

    /// tag_family: ["t16h5", "t25h7", "t25h9", "t36h11", "t36h11b1"]
    #[arg(value_enum, default_value = "t36h11")]
    tag_family: TagFamily,

    /// session config json (pattern and number of views)
    #[arg(long)]
    config: Option<String>,

    /// number of views to capture, overrides the config
    #[arg(long)]
    max_count: Option<usize>,

    /// upload queue directory
    #[arg(long, default_value = QUEUE_DIR)]
    queue_dir: String,

    /// directory for the named copy of the parameters and the report
    #[arg(long, default_value = ".")]
    save_dir: String,

    /// camera identifier recorded with the upload
    #[arg(long)]
    device_id: Option<String>,

    /// use every n-th image
    #[arg(long, default_value_t = 1)]
    step: usize,
}

/// Frames of the folder are treated as a live stream; the operator is
/// simulated by touching whenever a new complete detection shows up.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = CCapCli::parse();

    let mut config: SessionConfig = match &cli.config {
        Some(path) => object_from_json(Path::new(path))?,
        None => SessionConfig {
            pattern: PatternSpec::default_for(PatternType::AprilGrid),
            ..Default::default()
        },
    };
    if let Some(max_count) = cli.max_count {
        config.max_count = max_count;
    }

    let mut source = ImageFolderSource::open(&cli.path, cli.step)?;
    let frame_size = source.first_frame_size().ok_or("no readable images in folder")?;
    info!("{} images of {}x{}", source.len(), frame_size.0, frame_size.1);

    let detector: Arc<dyn FeatureDetector> = match config.pattern.pattern_type {
        PatternType::AprilGrid => Arc::new(AprilGridDetector::new(&cli.tag_family)),
        // circle grids are rejected by the session with UnsupportedPattern
        _ => Arc::new(ChessboardDetector::default()),
    };
    info!("detecting {:?}", config.pattern.pattern_type);
    let session = Arc::new(CalibrationSession::new(
        config,
        frame_size,
        detector,
        Arc::new(HomographySolver),
    )?);

    let (upload_tx, upload_rx) = mpsc::channel();
    let queue = UploadQueue::open(&cli.queue_dir)?.with_notifier(upload_tx);
    let save_dir = PathBuf::from(&cli.save_dir);
    let save_options = SaveOptions {
        save_dir: Some(save_dir.clone()),
        device_id: cli.device_id.clone(),
        ..Default::default()
    };
    let callback: FlowCallback = Box::new(
        move |result: &Result<CalibrationOutcome, SolveError>| match result {
            Ok(outcome) => {
                match save_outcome(outcome, &queue, &save_options) {
                    Ok(saved) => info!("parameters written to {}", saved.param_path.display()),
                    Err(e) => error!("could not save calibration: {}", e),
                }
                if let Err(e) = write_report(&save_dir.join("calibration_report.txt"), outcome) {
                    error!("could not write report: {}", e);
                }
            }
            Err(e) => error!("calibration failed: {}", e),
        },
    );
    let mut flow = FlowController::start(Arc::clone(&session), callback)?;

    let now = Instant::now();
    let progress = ProgressBar::new(session.max_count() as u64);
    let mut started = false;
    let mut last_touched: Option<i64> = None;
    let mut exhausted_at: Option<Instant> = None;
    loop {
        match flow.state() {
            FlowState::Welcome if !started => {
                started = flow.handle_event(FlowEvent::Touch);
            }
            FlowState::Capturing => {
                let cycle = match session.submit_frame(&mut source) {
                    Ok(cycle) => cycle,
                    Err(e) => {
                        warn!("dropping frame: {}", e);
                        FrameCycle::default()
                    }
                };
                if cycle.published {
                    let view = session.results().lock_and_fetch();
                    let (found, corner_num, time_ns) =
                        (view.found, view.corners.len(), view.time_ns());
                    view.unlock();
                    debug!("frame {}: {} corners, found {}", time_ns, corner_num, found);
                    if found && last_touched != Some(time_ns) {
                        flow.handle_event(FlowEvent::Touch);
                        last_touched = Some(time_ns);
                    }
                }
                progress.set_position(session.captured_count() as u64);

                let idle = !cycle.published && !cycle.submitted && !cycle.skipped;
                if source.is_exhausted() && idle {
                    let since = *exhausted_at.get_or_insert_with(Instant::now);
                    if since.elapsed() > Duration::from_millis(500) {
                        warn!(
                            "ran out of images with {}/{} views",
                            session.captured_count(),
                            session.max_count()
                        );
                        break;
                    }
                }
            }
            FlowState::Done | FlowState::NotInited => break,
            _ => {}
        }
        while let Ok(path) = upload_rx.try_recv() {
            info!("upload queued: {}", path.display());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    progress.finish();
    info!("{}", flow.status());
    flow.stop();
    while let Ok(path) = upload_rx.try_recv() {
        info!("upload queued: {}", path.display());
    }
    println!("capture took {:.3} sec", now.elapsed().as_secs_f64());
    Ok(())
}
