use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use speechclip::{print_summary, BatchProcessor, Config, Preset, Sampler, SourceMedia, UnitOutcome};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "speechclip")]
#[command(version, about = "Extract short speech samples from media files")]
#[command(long_about = "Samples speech-bearing audio from video/audio files as mono WAV clips, \
using ffmpeg when available and a built-in decoder otherwise.")]
struct Cli {
    /// Input video/audio files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Sampler preset: thorough, fast
    #[arg(short, long)]
    preset: Option<String>,

    /// Number of sources processed at once
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Directory the sampled clips are written to
    #[arg(short, long, default_value = "samples")]
    output_dir: PathBuf,

    /// Keep extracted ranges as-is instead of trimming silence
    #[arg(long)]
    no_refine: bool,

    /// Print a JSON summary instead of text
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct ClipSummary {
    index: usize,
    path: PathBuf,
    start_secs: f64,
    end_secs: f64,
    speech_secs: f64,
    scanned_secs: f64,
    segments: usize,
    backend: String,
    retries: u32,
    processing_secs: f64,
}

#[derive(Serialize)]
struct SourceSummary {
    source: PathBuf,
    clips: Vec<ClipSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact();

    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => builder.with_max_level(level).init(),
    }
}

/// One output name stem per input; repeated file stems get a numeric suffix.
fn clip_stems(inputs: &[PathBuf]) -> Vec<String> {
    let mut taken = HashSet::new();
    inputs
        .iter()
        .map(|input| {
            let stem = input
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned();
            let mut candidate = stem.clone();
            let mut n = 2;
            while !taken.insert(candidate.clone()) {
                candidate = format!("{stem}-{n}");
                n += 1;
            }
            candidate
        })
        .collect()
}

fn clip_path(output_dir: &Path, stem: &str, index: usize) -> PathBuf {
    output_dir.join(format!("{}_clip{:02}.wav", stem, index))
}

/// Move every clip of a unit into `output_dir`.
fn persist_outcome(
    outcome: UnitOutcome,
    stem: &str,
    output_dir: &Path,
    json: bool,
) -> SourceSummary {
    let source = outcome.source.path;
    match outcome.result {
        Ok(results) => {
            if !json {
                print_summary(&source, &results);
            }
            let mut clips = Vec::with_capacity(results.len());
            let mut error = None;
            for result in results {
                let dest = clip_path(output_dir, stem, result.clip_index);
                let summary = ClipSummary {
                    index: result.clip_index,
                    path: dest.clone(),
                    start_secs: result.range.start.as_secs_f64(),
                    end_secs: result.range.end.as_secs_f64(),
                    speech_secs: result.speech_duration.as_secs_f64(),
                    scanned_secs: result.scanned_duration.as_secs_f64(),
                    segments: result.segments_used,
                    backend: result.backend.to_string(),
                    retries: result.retries,
                    processing_secs: result.processing_time.as_secs_f64(),
                };
                match result.persist(&dest) {
                    Ok(_) => clips.push(summary),
                    Err(e) => {
                        warn!("Failed to write {}: {}", dest.display(), e);
                        error = Some(e.to_string());
                    }
                }
            }
            SourceSummary {
                source,
                clips,
                error,
            }
        }
        Err(e) => {
            if !json {
                println!();
                println!("  Source:     {}", source.display());
                println!("  Skipped:    {}", e);
            }
            SourceSummary {
                source,
                clips: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    // Load configuration, then apply command-line overrides
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(ref preset) = cli.preset {
        config.preset = preset
            .parse::<Preset>()
            .map_err(|e: String| anyhow::anyhow!(e))?;
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if cli.no_refine {
        config.refine_speech = false;
    }
    config
        .validate()
        .context("Configuration validation failed")?;

    info!("Inputs:   {}", cli.inputs.len());
    info!("Output:   {}", cli.output_dir.display());
    info!("Preset:   {}", config.preset);

    std::fs::create_dir_all(&cli.output_dir).with_context(|| {
        format!("Failed to create output directory {}", cli.output_dir.display())
    })?;

    let sampler = Sampler::from_config(&config).context("Failed to initialize sampler")?;
    let processor = BatchProcessor::new(sampler, config.concurrency).with_progress(!cli.json);

    let cancel = processor.cancel_handle();
    ctrlc::set_handler(move || {
        warn!("Interrupted, cancelling...");
        cancel.cancel();
    })
    .context("Failed to set Ctrl-C handler")?;

    let stems = clip_stems(&cli.inputs);
    let sources = cli.inputs.iter().map(SourceMedia::new).collect();
    let report = processor.process_sources(sources).await;
    let stats = report.stats.clone();

    let summaries: Vec<SourceSummary> = report
        .outcomes
        .into_iter()
        .map(|outcome| {
            let stem = &stems[outcome.index];
            persist_outcome(outcome, stem, &cli.output_dir, cli.json)
        })
        .collect();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        println!();
        println!(
            "  Done: {}/{} sources sampled, {} failed, {} cancelled in {:.2}s",
            stats.succeeded,
            stats.total_units,
            stats.failed,
            stats.cancelled,
            stats.total_time.as_secs_f64()
        );
    }

    if stats.succeeded == 0 && stats.total_units > 0 {
        anyhow::bail!("No source produced any audio");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_path() {
        let path = clip_path(Path::new("out"), "talk", 3);
        assert_eq!(path, PathBuf::from("out/talk_clip03.wav"));
    }

    #[test]
    fn test_same_stem_inputs_get_distinct_names() {
        let inputs = [
            PathBuf::from("a/talk.mp4"),
            PathBuf::from("b/talk.mp4"),
            PathBuf::from("intro.mkv"),
            PathBuf::from("c/talk.wav"),
        ];
        let stems = clip_stems(&inputs);
        assert_eq!(stems, vec!["talk", "talk-2", "intro", "talk-3"]);

        let first = clip_path(Path::new("out"), &stems[0], 0);
        let second = clip_path(Path::new("out"), &stems[1], 0);
        assert_ne!(first, second);
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["speechclip", "a.mp4", "b.mkv", "--preset", "fast", "-c", "3"]);
        assert_eq!(cli.inputs.len(), 2);
        assert_eq!(cli.preset.as_deref(), Some("fast"));
        assert_eq!(cli.concurrency, Some(3));
        assert_eq!(cli.output_dir, PathBuf::from("samples"));
        assert!(!cli.no_refine);
    }
}
