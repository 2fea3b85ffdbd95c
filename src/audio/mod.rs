pub mod clips;
pub mod energy;
pub mod merge;
pub mod vad;

pub use clips::{calculate_timeout, plan_clip_positions, ClipPosition};
pub use energy::{calculate_rms, EnergyAnalyzer, EnergyFrame};
pub use merge::merge_segments;
pub use vad::{
    detect_speech_regions, segment_chunks, total_speech_duration, write_speech_segments,
    SpeechScan, SpeechSegmenter,
};

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Metadata about an audio artifact.
#[derive(Debug, Clone)]
pub struct AudioMetadata {
    pub duration: Duration,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Duration,
    pub end: Duration,
}

impl TimeRange {
    pub fn new(start: Duration, end: Duration) -> Self {
        Self { start, end }
    }

    /// Get the duration of this range.
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Input media reference supplied by the caller.
#[derive(Debug, Clone)]
pub struct SourceMedia {
    pub path: PathBuf,
    pub duration: Option<Duration>,
    pub format: Option<String>,
}

impl SourceMedia {
    /// Reference a file; the container format is taken from its extension.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = format_from_extension(&path);
        Self {
            path,
            duration: None,
            format,
        }
    }

    /// Attach a pre-probed duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Override the container format hint.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into().to_lowercase());
        self
    }
}

fn format_from_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}
