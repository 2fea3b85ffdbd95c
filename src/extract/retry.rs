use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioMetadata, SourceMedia};
use crate::config::RetryPolicy;
use crate::error::{ExtractionFailure, SamplerError};
use crate::resources::{Artifact, ResourceManager};

use super::classify::{classify, ErrorCategory};
use super::{Cascade, ExtractionJob, ExtractionTarget};

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The backend wrote a valid artifact at this path.
    Produced(PathBuf),
    /// The backend could not run at all.
    Skipped(String),
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

/// Record of a single backend invocation.
#[derive(Debug, Clone)]
pub struct ExtractionAttempt {
    pub backend: &'static str,
    pub target: ExtractionTarget,
    /// Retries of this backend before this attempt.
    pub retry: u32,
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
}

/// A range that made it through the cascade.
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub artifact: Artifact,
    pub metadata: AudioMetadata,
    pub backend: &'static str,
    /// Transient retries spent on the successful backend.
    pub retries: u32,
    pub attempts: Vec<ExtractionAttempt>,
    /// Backoff delays slept, in order.
    pub backoff: Vec<Duration>,
}

impl ExtractionOutcome {
    /// Backend invocations that actually ran.
    pub fn attempt_count(&self) -> u32 {
        self.attempts
            .iter()
            .filter(|a| !matches!(a.outcome, AttemptOutcome::Skipped(_)))
            .count() as u32
    }
}

/// Drives one range through the cascade with classification-based recovery.
#[derive(Debug, Clone)]
pub struct RetryOrchestrator {
    cascade: Arc<Cascade>,
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    pub fn new(cascade: Arc<Cascade>, policy: RetryPolicy) -> Self {
        Self { cascade, policy }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cascade(&self) -> &Cascade {
        &self.cascade
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Extract `target` from `source`.
    ///
    /// - transient failures retry the same backend after `base_delay * 2^retry`,
    ///   up to `max_retries`, then surface
    /// - no-speech and codec failures move to the next backend
    /// - hard failures abort immediately
    ///
    /// Artifacts from attempts that did not succeed are deleted before this
    /// returns.
    pub async fn run(
        &self,
        source: &SourceMedia,
        target: ExtractionTarget,
        timeout: Duration,
        sample_rate: u32,
        resources: &ResourceManager,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutcome, ExtractionFailure> {
        let mut attempts: Vec<ExtractionAttempt> = Vec::new();
        let mut backoff: Vec<Duration> = Vec::new();
        let mut last_failure: Option<ExtractionFailure> = None;
        let mut total_attempts = 0u32;
        let mut total_retries = 0u32;

        let label = format!("clip{:02}", target.index());

        for backend in self.cascade.order_for(source.format.as_deref()) {
            if !backend.is_available().await {
                debug!("Skipping unavailable backend {}", backend.name());
                attempts.push(ExtractionAttempt {
                    backend: backend.name(),
                    target,
                    retry: 0,
                    elapsed: Duration::ZERO,
                    outcome: AttemptOutcome::Skipped("not available".to_string()),
                });
                if last_failure.is_none() {
                    last_failure = Some(ExtractionFailure {
                        backend: backend.name().to_string(),
                        category: ErrorCategory::Codec,
                        attempts: total_attempts,
                        retries: total_retries,
                        error: SamplerError::BackendUnavailable {
                            backend: backend.name().to_string(),
                            reason: "not available".to_string(),
                        },
                    });
                }
                continue;
            }

            let mut retry = 0u32;
            loop {
                if cancel.is_cancelled() {
                    return Err(self.failure(backend.name(), SamplerError::Cancelled, total_attempts, total_retries));
                }

                let artifact = resources
                    .allocate(&label)
                    .map_err(|e| self.failure(backend.name(), e, total_attempts, total_retries))?;

                let job = ExtractionJob {
                    source,
                    target,
                    output: artifact.path(),
                    sample_rate,
                    timeout,
                    cancel,
                };

                let started = Instant::now();
                total_attempts += 1;
                let result = backend.extract(&job).await;
                let elapsed = started.elapsed();

                let error = match result {
                    Ok(metadata) => {
                        attempts.push(ExtractionAttempt {
                            backend: backend.name(),
                            target,
                            retry,
                            elapsed,
                            outcome: AttemptOutcome::Produced(artifact.path().to_path_buf()),
                        });
                        info!(
                            "{} extracted range {} of {} in {:.2}s ({} retries)",
                            backend.name(),
                            target.index(),
                            source.path.display(),
                            elapsed.as_secs_f64(),
                            retry
                        );
                        return Ok(ExtractionOutcome {
                            artifact,
                            metadata,
                            backend: backend.name(),
                            retries: retry,
                            attempts,
                            backoff,
                        });
                    }
                    Err(e) => e,
                };

                drop(artifact);

                let category = classify(&error);
                attempts.push(ExtractionAttempt {
                    backend: backend.name(),
                    target,
                    retry,
                    elapsed,
                    outcome: AttemptOutcome::Failed {
                        category,
                        message: error.to_string(),
                    },
                });

                if matches!(error, SamplerError::Cancelled) {
                    return Err(self.failure(backend.name(), error, total_attempts, total_retries));
                }

                match category {
                    ErrorCategory::Transient if retry < self.policy.max_retries => {
                        let delay = self.policy.backoff(retry);
                        warn!(
                            "{} attempt {} failed ({}), retrying in {:?}: {}",
                            backend.name(),
                            retry + 1,
                            category,
                            delay,
                            error
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                return Err(self.failure(backend.name(), SamplerError::Cancelled, total_attempts, total_retries));
                            }
                        }
                        backoff.push(delay);
                        retry += 1;
                        total_retries += 1;
                    }
                    ErrorCategory::Transient | ErrorCategory::HardFailure => {
                        warn!(
                            "{} gave up on range {} of {} ({}): {}",
                            backend.name(),
                            target.index(),
                            source.path.display(),
                            category,
                            error
                        );
                        return Err(ExtractionFailure {
                            backend: backend.name().to_string(),
                            category,
                            attempts: total_attempts,
                            retries: total_retries,
                            error,
                        });
                    }
                    ErrorCategory::NoSpeech | ErrorCategory::Codec => {
                        debug!(
                            "{} failed with {} on {}, trying next backend: {}",
                            backend.name(),
                            category,
                            source.path.display(),
                            error
                        );
                        last_failure = Some(ExtractionFailure {
                            backend: backend.name().to_string(),
                            category,
                            attempts: total_attempts,
                            retries: total_retries,
                            error,
                        });
                        break;
                    }
                }
            }
        }

        Err(match last_failure {
            Some(mut failure) => {
                failure.attempts = total_attempts;
                failure.retries = total_retries;
                failure
            }
            None => ExtractionFailure {
                backend: "none".to_string(),
                category: ErrorCategory::HardFailure,
                attempts: 0,
                retries: 0,
                error: SamplerError::HardFailure("no extraction backends configured".to_string()),
            },
        })
    }

    fn failure(
        &self,
        backend: &str,
        error: SamplerError,
        attempts: u32,
        retries: u32,
    ) -> ExtractionFailure {
        ExtractionFailure {
            backend: backend.to_string(),
            category: classify(&error),
            attempts,
            retries,
            error,
        }
    }
}
