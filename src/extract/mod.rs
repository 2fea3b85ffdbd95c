pub mod classify;
pub mod ffmpeg;
pub mod native;
pub mod retry;

pub use classify::{classify, classify_diagnostic, ErrorCategory};
pub use ffmpeg::FfmpegBackend;
pub use native::NativeBackend;
pub use retry::{AttemptOutcome, ExtractionAttempt, ExtractionOutcome, RetryOrchestrator};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hound::WavReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audio::{AudioMetadata, ClipPosition, SourceMedia};
use crate::error::{Result, SamplerError};

/// Which part of a source an attempt extracts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtractionTarget {
    /// The whole source from 0, optionally capped in length.
    WholeFile { limit: Option<Duration> },
    /// One planned window.
    Clip(ClipPosition),
}

impl ExtractionTarget {
    pub fn start(&self) -> Duration {
        match self {
            ExtractionTarget::WholeFile { .. } => Duration::ZERO,
            ExtractionTarget::Clip(clip) => clip.start,
        }
    }

    pub fn length(&self) -> Option<Duration> {
        match self {
            ExtractionTarget::WholeFile { limit } => *limit,
            ExtractionTarget::Clip(clip) => Some(clip.duration),
        }
    }

    /// Planned index; a whole-file target is index 0.
    pub fn index(&self) -> usize {
        match self {
            ExtractionTarget::WholeFile { .. } => 0,
            ExtractionTarget::Clip(clip) => clip.index,
        }
    }
}

/// Everything a backend needs for one attempt.
#[derive(Debug)]
pub struct ExtractionJob<'a> {
    pub source: &'a SourceMedia,
    pub target: ExtractionTarget,
    /// Where the mono 16-bit PCM WAV must be written.
    pub output: &'a Path,
    pub sample_rate: u32,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// A way of turning a source into a normalized audio artifact.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend can run at all on this machine.
    async fn is_available(&self) -> bool;

    /// Container formats this backend should be tried first for.
    fn preferred_formats(&self) -> &[&'static str] {
        &[]
    }

    /// Extract `job.target` into `job.output`, enforcing `job.timeout`.
    async fn extract(&self, job: &ExtractionJob<'_>) -> Result<AudioMetadata>;

    /// Read the source duration from container metadata, if this backend can.
    async fn probe_duration(&self, _source: &Path) -> Result<Option<Duration>> {
        Ok(None)
    }
}

/// Ordered fallback chain of extraction backends.
#[derive(Clone)]
pub struct Cascade {
    backends: Vec<Arc<dyn ExtractionBackend>>,
}

impl Cascade {
    /// Backends are tried in the given priority order.
    pub fn new(backends: Vec<Arc<dyn ExtractionBackend>>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[Arc<dyn ExtractionBackend>] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backends in attempt order for a container format.
    ///
    /// Backends that list the format as preferred move to the front; the rest
    /// keep their priority order.
    pub fn order_for(&self, format: Option<&str>) -> Vec<Arc<dyn ExtractionBackend>> {
        let Some(format) = format else {
            return self.backends.clone();
        };
        let (preferred, rest): (Vec<_>, Vec<_>) = self
            .backends
            .iter()
            .cloned()
            .partition(|b| b.preferred_formats().iter().any(|f| f.eq_ignore_ascii_case(format)));
        preferred.into_iter().chain(rest).collect()
    }

    /// Probe the source duration with the first available backend that knows it.
    pub async fn probe_duration(&self, source: &Path) -> Option<Duration> {
        for backend in &self.backends {
            if !backend.is_available().await {
                continue;
            }
            match backend.probe_duration(source).await {
                Ok(Some(duration)) => {
                    debug!(
                        "{} probed {}: {:.2}s",
                        backend.name(),
                        source.display(),
                        duration.as_secs_f64()
                    );
                    return Some(duration);
                }
                Ok(None) => {}
                Err(e) => debug!("{} could not probe {}: {}", backend.name(), source.display(), e),
            }
        }
        None
    }
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|b| b.name()))
            .finish()
    }
}

/// Check that a backend left a readable mono WAV at the expected rate.
pub fn verify_artifact(backend: &str, path: &Path, sample_rate: u32) -> Result<AudioMetadata> {
    let missing = |diagnostic: String| SamplerError::OutputMissing {
        backend: backend.to_string(),
        diagnostic,
    };

    let size = std::fs::metadata(path)
        .map_err(|e| missing(format!("output file was not created: {e}")))?
        .len();
    if size == 0 {
        return Err(missing("output file is empty".to_string()));
    }

    let reader = WavReader::open(path).map_err(|e| missing(format!("unreadable WAV output: {e}")))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != sample_rate {
        return Err(SamplerError::ExtractionFailed {
            backend: backend.to_string(),
            diagnostic: format!(
                "unexpected format: {} channels at {} Hz, wanted mono at {} Hz",
                spec.channels, spec.sample_rate, sample_rate
            ),
        });
    }

    let frames = reader.duration();
    if frames == 0 {
        return Err(missing("output file is empty".to_string()));
    }

    Ok(AudioMetadata {
        duration: Duration::from_secs_f64(frames as f64 / sample_rate as f64),
        sample_rate,
        channels: 1,
    })
}
