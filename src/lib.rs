pub mod board;
pub mod detector;
pub mod error;
pub mod flow;
pub mod io;
pub mod queue;
pub mod result_buffer;
pub mod session;
pub mod solver;
pub mod source;
pub mod types;
pub mod worker;

pub use detector::{AprilGridDetector, ChessboardDetector, Detection, FeatureDetector};
pub use error::{ConfigError, FrameError, IoError, QueueError, SolveError};
pub use flow::{EventMask, FlowCallback, FlowController, FlowEvent, FlowOptions, FlowState};
pub use result_buffer::{DetectionResult, ResultBuffer, ResultView};
pub use session::{CalibrationSession, FrameCycle, SessionConfig};
pub use solver::{CalibrationSolver, HomographySolver};
pub use source::{FrameSource, ImageFolderSource, VideoFrame};
pub use types::*;
