use crate::types::PatternType;

/// Reasons a session cannot be constructed.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("pattern type {0:?} is not supported by the detector")]
    UnsupportedPattern(PatternType),
    #[error("max_count must be at least 1")]
    InvalidMaxCount,
    #[error("invalid frame size {width}x{height}")]
    InvalidFrameSize { width: u32, height: u32 },
    #[error("pattern grid {cols}x{rows} is too small")]
    InvalidPatternSize { cols: usize, rows: usize },
    #[error("failed to spawn corner finder thread")]
    WorkerSpawn(#[source] std::io::Error),
}

/// A source frame the session cannot take.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame size {actual:?} does not match session frame size {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("frame has {actual} bytes, expected {expected}")]
    ByteLength { expected: usize, actual: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("no captured views to calibrate from")]
    NoViews,
    #[error("view {view} has {actual} corners, expected {expected}")]
    PointCountMismatch {
        view: usize,
        expected: usize,
        actual: usize,
    },
    #[error("degenerate view geometry: {0}")]
    Degenerate(String),
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("could not create queue directory {path}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write index file {path}")]
    WriteIndex {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
