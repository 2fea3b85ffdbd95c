use std::time::Duration;

use thiserror::Error;

use crate::extract::ErrorCategory;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Backend {backend} extraction failed: {diagnostic}")]
    ExtractionFailed { backend: String, diagnostic: String },

    #[error("Backend {backend} produced no readable output: {diagnostic}")]
    OutputMissing { backend: String, diagnostic: String },

    #[error("No audio track in {0}")]
    NoAudioTrack(String),

    #[error("Insufficient speech: collected {collected:?}, need at least {required:?}")]
    InsufficientSpeech {
        collected: Duration,
        required: Duration,
    },

    #[error("Unexpected failure: {0}")]
    HardFailure(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Exhausted(#[from] Box<ExtractionFailure>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl SamplerError {
    /// Name of the backend that produced this error, when one did.
    pub fn backend(&self) -> Option<&str> {
        match self {
            SamplerError::BackendUnavailable { backend, .. }
            | SamplerError::Timeout { backend, .. }
            | SamplerError::ExtractionFailed { backend, .. }
            | SamplerError::OutputMissing { backend, .. } => Some(backend),
            SamplerError::Exhausted(failure) => Some(&failure.backend),
            _ => None,
        }
    }
}

/// Terminal failure of one range after the cascade gave up on it.
#[derive(Error, Debug)]
#[error(
    "{category} failure from {backend} after {attempts} attempt(s), {retries} retries: {error}"
)]
pub struct ExtractionFailure {
    pub backend: String,
    pub category: ErrorCategory,
    pub attempts: u32,
    pub retries: u32,
    #[source]
    pub error: SamplerError,
}

impl From<ExtractionFailure> for SamplerError {
    fn from(failure: ExtractionFailure) -> Self {
        SamplerError::Exhausted(Box::new(failure))
    }
}

pub type Result<T> = std::result::Result<T, SamplerError>;
