use crate::audio::SourceMedia;
use crate::error::{Result, SamplerError};
use crate::pipeline::{ExtractionResult, Sampler};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One queued source with its own cancellation handle.
#[derive(Debug, Clone)]
pub struct BatchUnit {
    pub source: SourceMedia,
    pub cancel: CancellationToken,
}

impl BatchUnit {
    /// Cancel just this unit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Result of processing a single unit.
#[derive(Debug)]
pub struct UnitOutcome {
    pub index: usize,
    pub source: SourceMedia,
    pub result: Result<Vec<ExtractionResult>>,
    pub elapsed: Duration,
}

impl UnitOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.result, Err(SamplerError::Cancelled))
    }
}

/// Statistics from a batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total_units: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_time: Duration,
}

#[derive(Debug)]
pub struct BatchReport {
    /// Outcomes in submission order.
    pub outcomes: Vec<UnitOutcome>,
    pub stats: BatchStats,
}

/// Runs many sources through a [`Sampler`] on a bounded worker pool.
pub struct BatchProcessor {
    sampler: Arc<Sampler>,
    concurrency: usize,
    show_progress: bool,
    cancel: CancellationToken,
}

impl BatchProcessor {
    pub fn new(sampler: Sampler, concurrency: usize) -> Self {
        Self {
            sampler: Arc::new(sampler),
            concurrency: concurrency.max(1),
            show_progress: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Enable or disable progress bar display.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Token cancelling the whole batch, including units not yet started.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wrap a source as a unit that is cancelled along with the batch.
    pub fn unit(&self, source: SourceMedia) -> BatchUnit {
        BatchUnit {
            source,
            cancel: self.cancel.child_token(),
        }
    }

    /// Process all sources with default units.
    pub async fn process_sources(&self, sources: Vec<SourceMedia>) -> BatchReport {
        let units = sources.into_iter().map(|s| self.unit(s)).collect();
        self.process(units).await
    }

    /// Process all units concurrently; one unit failing never stops the others.
    pub async fn process(&self, units: Vec<BatchUnit>) -> BatchReport {
        let total_units = units.len();
        let start_time = Instant::now();

        info!(
            "Processing {} source(s) with {} worker(s)",
            total_units, self.concurrency
        );

        let progress_bar = if self.show_progress && total_units > 0 {
            let pb = ProgressBar::new(total_units as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} sources ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        // Use semaphore to limit concurrency
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut futures = FuturesUnordered::new();

        for (index, unit) in units.into_iter().enumerate() {
            let sem = semaphore.clone();
            let sampler = self.sampler.clone();
            let pb = progress_bar.clone();

            futures.push(async move {
                let BatchUnit { source, cancel } = unit;

                // Waits if at concurrency limit; a cancelled unit never takes a slot.
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = sem.acquire_owned() => permit.ok(),
                };

                let unit_start = Instant::now();
                let result = match permit {
                    Some(_permit) => {
                        debug!("Starting {}", source.path.display());
                        sampler.sample_with_cancel(&source, &cancel).await
                    }
                    None => Err(SamplerError::Cancelled),
                };
                let elapsed = unit_start.elapsed();

                if let Some(ref pb) = pb {
                    pb.inc(1);
                }

                match &result {
                    Ok(results) => debug!(
                        "{} completed with {} range(s) in {:.2}s",
                        source.path.display(),
                        results.len(),
                        elapsed.as_secs_f64()
                    ),
                    Err(SamplerError::Cancelled) => {
                        debug!("{} cancelled", source.path.display())
                    }
                    Err(e) => warn!("{} failed: {}", source.path.display(), e),
                }

                UnitOutcome {
                    index,
                    source,
                    result,
                    elapsed,
                }
            });
        }

        let mut outcomes: Vec<UnitOutcome> = Vec::with_capacity(total_units);
        while let Some(outcome) = futures.next().await {
            outcomes.push(outcome);
        }

        if let Some(pb) = progress_bar {
            pb.finish_with_message("Sampling complete");
        }

        // Sort by submission index to maintain order
        outcomes.sort_by_key(|o| o.index);

        let mut stats = BatchStats {
            total_units,
            total_time: start_time.elapsed(),
            ..BatchStats::default()
        };
        for outcome in &outcomes {
            match &outcome.result {
                Ok(_) => stats.succeeded += 1,
                Err(SamplerError::Cancelled) => stats.cancelled += 1,
                Err(_) => stats.failed += 1,
            }
        }

        info!(
            "Batch complete: {}/{} succeeded, {} failed, {} cancelled in {:.2}s",
            stats.succeeded,
            stats.total_units,
            stats.failed,
            stats.cancelled,
            stats.total_time.as_secs_f64()
        );

        BatchReport { outcomes, stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Cascade;
    use crate::resources::ResourceManager;

    fn processor(concurrency: usize) -> BatchProcessor {
        let sampler = Sampler::new(Cascade::new(vec![]), ResourceManager::new().unwrap());
        BatchProcessor::new(sampler, concurrency)
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        assert_eq!(processor(0).concurrency, 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let report = processor(2).process(vec![]).await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.stats.total_units, 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_batch() {
        let report = processor(2)
            .process_sources(vec![
                SourceMedia::new("/nonexistent/a.mp4"),
                SourceMedia::new("/nonexistent/b.mp4"),
                SourceMedia::new("/nonexistent/c.mp4"),
            ])
            .await;
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.stats.failed, 3);
        let names: Vec<_> = report
            .outcomes
            .iter()
            .map(|o| o.source.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.mp4", "c.mp4"]);
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_units() {
        let processor = processor(1);
        processor.cancel_handle().cancel();
        let report = processor
            .process_sources(vec![SourceMedia::new("/nonexistent/a.mp4")])
            .await;
        assert_eq!(report.stats.cancelled, 1);
        assert!(report.outcomes[0].is_cancelled());
    }
}
