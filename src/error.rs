use thiserror::Error;

use crate::stability::StabilityDiagnostics;

#[derive(Error, Debug)]
pub enum HarError {
    #[error("Configuration error in {option}: {message}")]
    Config { option: String, message: String },

    #[error("Browser connection lost: {0}")]
    Connection(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Timed out after {0}s: {1}")]
    Timeout(u64, String),

    #[error("Page never stabilized: {0}")]
    StabilityTimeout(StabilityDiagnostics),

    #[error("Response body unavailable for request {request_id}: {message}")]
    BodyFetch { request_id: String, message: String },

    #[error("Projection failed: {0}")]
    Projection(String),

    #[error("HAR serialization failed: {0}")]
    Serialization(String),

    #[error("Internal invariant violated: {0}")]
    Internal(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarError {
    pub fn config(option: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            option: option.into(),
            message: message.into(),
        }
    }

    /// Stable exit code per error kind, consumed by both binaries.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::Connection(_) => 3,
            Self::Navigation(_) => 4,
            Self::Timeout(..) | Self::StabilityTimeout(_) => 5,
            Self::BodyFetch { .. } => 6,
            Self::Projection(_) => 7,
            Self::Serialization(_) | Self::Json(_) => 8,
            Self::Io(_) => 9,
            Self::Internal(_) => 10,
        }
    }

    /// Entry-level errors are absorbed by the recorders; everything else
    /// propagates out of the orchestrator.
    pub fn is_entry_level(&self) -> bool {
        matches!(self, Self::BodyFetch { .. } | Self::Projection(_))
    }
}
