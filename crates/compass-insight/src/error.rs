use thiserror::Error;

use compass_core::CompassError;

/// Errors that can occur in background analysis and the refresh queue.
#[derive(Error, Debug)]
pub enum InsightError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("refresh queue closed")]
    QueueClosed,
    #[error("analysis failed: {0}")]
    Analysis(String),
}

impl From<CompassError> for InsightError {
    fn from(err: CompassError) -> Self {
        InsightError::Storage(err.to_string())
    }
}
