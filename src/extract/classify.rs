use std::io::ErrorKind;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::SamplerError;

/// Recovery category of a failed extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Retry the same backend after a backoff delay.
    Transient,
    /// The backend ran but found no usable audio; try the next backend.
    NoSpeech,
    /// Format or codec incompatibility; try the next backend.
    Codec,
    /// Abort the range and surface the error.
    HardFailure,
}

impl ErrorCategory {
    /// Whether the cascade should move on to the next backend.
    pub fn advances_cascade(&self) -> bool {
        matches!(self, ErrorCategory::NoSpeech | ErrorCategory::Codec)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::NoSpeech => write!(f, "no-speech"),
            ErrorCategory::Codec => write!(f, "codec"),
            ErrorCategory::HardFailure => write!(f, "hard-failure"),
        }
    }
}

fn transient_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)timed? ?out|resource temporarily unavailable|try again|cannot allocate memory|out of memory|too many open files|device or resource busy|connection (reset|refused|aborted)|broken pipe|network|input/output error|i/o error|interrupted",
        )
        .expect("Invalid regex")
    })
}

fn no_speech_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)does not contain any stream|matches no streams|output file is empty|no audio|audio stream not found|no speech|silent",
        )
        .expect("Invalid regex")
    })
}

fn codec_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)codec|unsupported|not supported|not implemented|invalid data found|moov atom not found|unknown format|unrecognized|malformed|corrupt|decod|demux|probe|unexpected format",
        )
        .expect("Invalid regex")
    })
}

/// Map backend diagnostic text to a recovery category.
pub fn classify_diagnostic(text: &str) -> ErrorCategory {
    if transient_pattern().is_match(text) {
        ErrorCategory::Transient
    } else if no_speech_pattern().is_match(text) {
        ErrorCategory::NoSpeech
    } else if codec_pattern().is_match(text) {
        ErrorCategory::Codec
    } else {
        ErrorCategory::HardFailure
    }
}

fn classify_io(error: &std::io::Error) -> ErrorCategory {
    match error.kind() {
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::OutOfMemory
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => ErrorCategory::Transient,
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => ErrorCategory::Codec,
        _ => classify_diagnostic(&error.to_string()),
    }
}

/// Map a failure from any backend to a recovery category.
pub fn classify(error: &SamplerError) -> ErrorCategory {
    match error {
        SamplerError::Timeout { .. } => ErrorCategory::Transient,
        SamplerError::BackendUnavailable { .. } => ErrorCategory::Codec,
        SamplerError::NoAudioTrack(_) | SamplerError::InsufficientSpeech { .. } => {
            ErrorCategory::NoSpeech
        }
        SamplerError::ExtractionFailed { diagnostic, .. }
        | SamplerError::OutputMissing { diagnostic, .. } => classify_diagnostic(diagnostic),
        SamplerError::Decode(message) => match classify_diagnostic(message) {
            ErrorCategory::HardFailure => ErrorCategory::Codec,
            category => category,
        },
        SamplerError::Io(e) => classify_io(e),
        SamplerError::Wav(hound::Error::IoError(e)) => classify_io(e),
        SamplerError::Wav(_) => ErrorCategory::Codec,
        SamplerError::Exhausted(failure) => failure.category,
        SamplerError::HardFailure(_)
        | SamplerError::FileNotFound(_)
        | SamplerError::Config(_)
        | SamplerError::Cancelled => ErrorCategory::HardFailure,
    }
}
