//! Error types for the message pipeline.

use thiserror::Error;

/// Errors returned by pipeline operations.
///
/// Ordering problems in the stream are not errors; they become
/// [`Alert`](crate::entities::Alert)s on the committed state.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No player attached")]
    NoPlayer,

    #[error("Player attachment closed")]
    Closed,

    #[error("Invalid frame rate: {0} (must be finite and > 0)")]
    InvalidFrameRate(f64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
