use thiserror::Error;

use crate::data::TargetId;

/// Errors that can abort a training or evaluation run.
///
/// There is no retry policy: configuration and shape errors are fatal before
/// the first batch, and a failure inside a batch aborts the epoch and the run.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
    #[error("shape mismatch: expected {expected} entries per sample, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("no offset tables available for target {0}")]
    MissingOffsets(TargetId),
    #[error("no detection records available for target {0}")]
    MissingDetections(TargetId),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
