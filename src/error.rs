//! Error types for the decoding engine.
//!
//! Cancellation is deliberately absent: a cancelled session is a normal
//! terminal state reported through [`crate::generation::SessionState`] and
//! [`crate::generation::GenerationOutcome`], not an error.

use thiserror::Error;

/// Main error type for decoding operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller broke an API contract (mismatched cache shapes, zero codebooks,
    /// stepping a finished session). Never retried.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// The forward pass could not produce a prediction for this step.
    #[error("Generation failed at step {step}: {source}")]
    GenerationFailed {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The text conditioner failed to encode a prompt.
    #[error("Conditioning failed: {0}")]
    Conditioning(#[source] anyhow::Error),

    /// The audio codec failed to decode generated codes.
    #[error("Codec decode failed: {0}")]
    Codec(#[source] anyhow::Error),

    /// Configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition(message.into())
    }

    /// Whether the error carries an actionable message for the user, as
    /// opposed to a programming mistake in the caller.
    pub fn is_generation_failure(&self) -> bool {
        matches!(self, Error::GenerationFailed { .. })
    }
}

/// Result type alias for decoding operations.
pub type Result<T> = std::result::Result<T, Error>;
