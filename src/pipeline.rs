use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{
    calculate_timeout, detect_speech_regions, merge_segments, plan_clip_positions,
    total_speech_duration, write_speech_segments, AudioMetadata, SourceMedia, TimeRange,
};
use crate::config::{AudioConfig, Config, RetryPolicy, SamplerConfig};
use crate::error::{Result, SamplerError};
use crate::extract::{
    Cascade, ExtractionAttempt, ExtractionBackend, ExtractionTarget, FfmpegBackend,
    NativeBackend, RetryOrchestrator,
};
use crate::resources::{Artifact, ResourceManager, StopSignal};

/// One sampled range of a source, ready to hand to a transcriber.
#[derive(Debug)]
pub struct ExtractionResult {
    pub source: PathBuf,
    /// Planned index of the range within its source.
    pub clip_index: usize,
    /// Position of the range in the source timeline.
    pub range: TimeRange,
    artifact: Artifact,
    pub metadata: AudioMetadata,
    /// Speech retained in the artifact.
    pub speech_duration: Duration,
    /// Extracted audio scanned to find that speech.
    pub scanned_duration: Duration,
    pub segments_used: usize,
    pub processing_time: Duration,
    pub backend: &'static str,
    pub attempts: Vec<ExtractionAttempt>,
    pub retries: u32,
}

impl ExtractionResult {
    /// Location of the temporary artifact.
    pub fn artifact_path(&self) -> &Path {
        self.artifact.path()
    }

    /// Take ownership of the audio by moving it to `dest`.
    pub fn persist(self, dest: impl AsRef<Path>) -> Result<PathBuf> {
        self.artifact.persist(dest)
    }

    /// Delete the artifact now.
    pub fn cleanup(self) -> Result<()> {
        self.artifact.cleanup()
    }

    pub fn into_artifact(self) -> Artifact {
        self.artifact
    }
}

/// Samples speech-bearing audio out of media files.
///
/// For each source this plans ranges, drives each range through the
/// extraction cascade, optionally trims silence, and keeps the results
/// within the audio budget.
#[derive(Debug, Clone)]
pub struct Sampler {
    orchestrator: RetryOrchestrator,
    sampler_config: SamplerConfig,
    audio_config: AudioConfig,
    resources: ResourceManager,
    refine_speech: bool,
}

impl Sampler {
    pub fn new(cascade: Cascade, resources: ResourceManager) -> Self {
        Self {
            orchestrator: RetryOrchestrator::new(Arc::new(cascade), RetryPolicy::default()),
            sampler_config: SamplerConfig::default(),
            audio_config: AudioConfig::default(),
            resources,
            refine_speech: true,
        }
    }

    /// Build the default cascade (ffmpeg, then the built-in decoder) from host settings.
    pub fn from_config(config: &Config) -> Result<Self> {
        let ffmpeg = match (&config.ffmpeg_path, &config.ffprobe_path) {
            (None, None) => FfmpegBackend::new(),
            (ffmpeg, ffprobe) => FfmpegBackend::with_paths(
                ffmpeg.clone().unwrap_or_else(|| PathBuf::from("ffmpeg")),
                ffprobe.clone().unwrap_or_else(|| PathBuf::from("ffprobe")),
            ),
        };
        let backends: Vec<Arc<dyn ExtractionBackend>> =
            vec![Arc::new(ffmpeg), Arc::new(NativeBackend::new())];

        let resources = match &config.temp_dir {
            Some(dir) => ResourceManager::in_dir(dir)?,
            None => ResourceManager::new()?,
        };

        Ok(Self::new(Cascade::new(backends), resources)
            .with_sampler_config(config.sampler_config())
            .with_retry_policy(config.retry_policy())
            .with_refinement(config.refine_speech))
    }

    pub fn with_sampler_config(mut self, config: SamplerConfig) -> Self {
        self.sampler_config = config;
        self
    }

    pub fn with_audio_config(mut self, config: AudioConfig) -> Self {
        self.audio_config = config;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.orchestrator = self.orchestrator.with_policy(policy);
        self
    }

    /// Enable or disable silence trimming of extracted ranges.
    pub fn with_refinement(mut self, enabled: bool) -> Self {
        self.refine_speech = enabled;
        self
    }

    pub fn sampler_config(&self) -> &SamplerConfig {
        &self.sampler_config
    }

    pub fn audio_config(&self) -> &AudioConfig {
        &self.audio_config
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Speech kept per source: the stricter of the two configured budgets.
    pub fn speech_budget(&self) -> Duration {
        self.sampler_config
            .target_speech_duration
            .min(self.audio_config.max_total_audio)
    }

    pub async fn sample(&self, source: &SourceMedia) -> Result<Vec<ExtractionResult>> {
        self.sample_with_cancel(source, &CancellationToken::new()).await
    }

    /// Sample `source`, stopping early when `cancel` fires.
    ///
    /// Returns the ranges that produced audio, in planned order. Fails only
    /// when no range did; the error is the last range's.
    pub async fn sample_with_cancel(
        &self,
        source: &SourceMedia,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractionResult>> {
        if !source.path.exists() {
            return Err(SamplerError::FileNotFound(source.path.display().to_string()));
        }

        let duration = match source.duration {
            Some(d) => Some(d),
            None => self.orchestrator.cascade().probe_duration(&source.path).await,
        };

        let targets: Vec<ExtractionTarget> = match duration {
            Some(d) => plan_clip_positions(d.as_secs_f64(), &self.audio_config)
                .into_iter()
                .map(ExtractionTarget::Clip)
                .collect(),
            None => {
                debug!(
                    "Duration of {} unknown, extracting from the start",
                    source.path.display()
                );
                vec![ExtractionTarget::WholeFile {
                    limit: Some(self.audio_config.max_total_audio),
                }]
            }
        };

        if targets.is_empty() {
            return Err(SamplerError::InsufficientSpeech {
                collected: Duration::ZERO,
                required: self.sampler_config.min_segment_duration,
            });
        }

        info!(
            "Sampling {} range(s) from {}",
            targets.len(),
            source.path.display()
        );

        let budget = self.speech_budget();
        let mut collected = Duration::ZERO;
        let mut results = Vec::new();
        let mut last_error: Option<SamplerError> = None;

        for target in targets {
            if collected >= budget {
                debug!("Speech budget reached, skipping remaining ranges");
                break;
            }
            if cancel.is_cancelled() {
                return Err(SamplerError::Cancelled);
            }
            let remaining = budget - collected;
            if self.refine_speech && remaining < self.sampler_config.min_segment_duration {
                debug!("Remaining budget below one segment, skipping remaining ranges");
                break;
            }

            match self.extract_range(source, target, remaining, cancel).await {
                Ok(result) => {
                    if collected + result.speech_duration > budget {
                        debug!(
                            "Dropping range {} ({:.2}s): would exceed the {:.2}s budget",
                            result.clip_index,
                            result.speech_duration.as_secs_f64(),
                            budget.as_secs_f64()
                        );
                        continue;
                    }
                    collected += result.speech_duration;
                    results.push(result);
                }
                Err(SamplerError::Cancelled) => return Err(SamplerError::Cancelled),
                Err(e) => {
                    warn!(
                        "Range {} of {} failed: {}",
                        target.index(),
                        source.path.display(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(SamplerError::Cancelled);
        }

        if results.is_empty() {
            return Err(last_error.unwrap_or(SamplerError::InsufficientSpeech {
                collected,
                required: self.sampler_config.min_segment_duration,
            }));
        }

        info!(
            "Collected {:.2}s of audio from {} range(s) of {}",
            collected.as_secs_f64(),
            results.len(),
            source.path.display()
        );

        Ok(results)
    }

    /// Extract and optionally refine one range, keeping at most `budget` of speech.
    pub async fn extract_range(
        &self,
        source: &SourceMedia,
        target: ExtractionTarget,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let start_time = Instant::now();
        let timeout = match target {
            ExtractionTarget::Clip(clip) => calculate_timeout(clip.duration),
            ExtractionTarget::WholeFile { .. } => self.audio_config.whole_file_timeout,
        };

        let outcome = self
            .orchestrator
            .run(
                source,
                target,
                timeout,
                self.sampler_config.sample_rate,
                &self.resources,
                cancel,
            )
            .await
            .map_err(|failure| {
                if matches!(failure.error, SamplerError::Cancelled) {
                    SamplerError::Cancelled
                } else {
                    SamplerError::from(failure)
                }
            })?;

        let range_start = target.start();
        let range = TimeRange::new(range_start, range_start + outcome.metadata.duration);
        let retries = outcome.retries;

        let refined = if self.refine_speech {
            self.refine(outcome.artifact, budget, cancel).await?
        } else {
            let duration = outcome.metadata.duration;
            Refined {
                artifact: outcome.artifact,
                metadata: outcome.metadata,
                speech: duration,
                scanned: duration,
                segments: 1,
            }
        };

        Ok(ExtractionResult {
            source: source.path.clone(),
            clip_index: target.index(),
            range,
            artifact: refined.artifact,
            speech_duration: refined.speech,
            scanned_duration: refined.scanned,
            segments_used: refined.segments,
            processing_time: start_time.elapsed(),
            backend: outcome.backend,
            attempts: outcome.attempts,
            retries,
            metadata: refined.metadata,
        })
    }

    /// Replace an extracted artifact with one holding only its speech.
    async fn refine(
        &self,
        extracted: Artifact,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<Refined> {
        let output = self.resources.allocate("speech")?;
        let input_path = extracted.path().to_path_buf();
        let output_path = output.path().to_path_buf();
        let config = self.sampler_config.clone();

        let stop = StopSignal::new();
        // Declared after `output` so it is raised before `output` is deleted.
        let _guard = stop.raise_on_drop();
        let task = tokio::task::spawn_blocking(move || {
            stop.run_writing(&output_path, || {
                trim_to_speech(&input_path, &output_path, &config, budget, &stop)
            })
        });

        let trimmed = tokio::select! {
            joined = task => joined
                .map_err(|e| SamplerError::HardFailure(format!("refinement task failed: {e}")))??,
            _ = cancel.cancelled() => return Err(SamplerError::Cancelled),
        };

        // The unrefined audio is no longer needed.
        if let Err(e) = extracted.cleanup() {
            debug!("Failed to remove unrefined artifact: {}", e);
        }

        Ok(Refined {
            artifact: output,
            speech: total_speech_duration(&trimmed.kept),
            scanned: trimmed.scanned,
            segments: trimmed.kept.len(),
            metadata: trimmed.metadata,
        })
    }
}

struct Refined {
    artifact: Artifact,
    metadata: AudioMetadata,
    speech: Duration,
    scanned: Duration,
    segments: usize,
}

#[derive(Debug)]
struct Trimmed {
    kept: Vec<TimeRange>,
    metadata: AudioMetadata,
    scanned: Duration,
}

/// Detect speech in `input` and write up to `budget` of it to `output`.
fn trim_to_speech(
    input: &Path,
    output: &Path,
    config: &SamplerConfig,
    budget: Duration,
    stop: &StopSignal,
) -> Result<Trimmed> {
    let scan = detect_speech_regions(input, config)?;
    let kept = merge_segments(&scan.segments, config.merge_gap, budget);
    let speech = total_speech_duration(&kept);
    if kept.is_empty() || speech < config.min_segment_duration {
        return Err(SamplerError::InsufficientSpeech {
            collected: speech,
            required: config.min_segment_duration,
        });
    }
    if stop.is_raised() {
        return Err(SamplerError::Cancelled);
    }
    let metadata = write_speech_segments(input, &kept, output)?;
    Ok(Trimmed {
        kept,
        metadata,
        scanned: scan.scanned,
    })
}

/// Print a summary of sampled results.
pub fn print_summary(source: &Path, results: &[ExtractionResult]) {
    let speech: Duration = results.iter().map(|r| r.speech_duration).sum();
    let scanned: Duration = results.iter().map(|r| r.scanned_duration).sum();

    println!();
    println!("  Source:     {}", source.display());
    println!(
        "  Speech:     {:.1}s from {:.1}s scanned",
        speech.as_secs_f64(),
        scanned.as_secs_f64()
    );
    for result in results {
        println!(
            "    [{:02}] {:>7.1}s..{:<7.1}s  {:.1}s speech, {} segment(s) via {} in {:.2}s",
            result.clip_index,
            result.range.start.as_secs_f64(),
            result.range.end.as_secs_f64(),
            result.speech_duration.as_secs_f64(),
            result.segments_used,
            result.backend,
            result.processing_time.as_secs_f64()
        );
    }
}
