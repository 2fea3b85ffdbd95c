use crate::error::{Result, SamplerError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Named sampler preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Thorough,
    Fast,
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Preset::Thorough => write!(f, "thorough"),
            Preset::Fast => write!(f, "fast"),
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "thorough" => Ok(Preset::Thorough),
            "fast" => Ok(Preset::Fast),
            _ => Err(format!("Unknown preset: {}. Use 'thorough' or 'fast'", s)),
        }
    }
}

/// Configuration for the energy analyzer, speech segmenter and merger.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    /// Amount of speech to collect before the scan stops.
    pub target_speech_duration: Duration,

    /// Segments shorter than this are discarded as noise.
    pub min_segment_duration: Duration,

    /// Output sample rate in Hz.
    pub sample_rate: u32,

    /// Smoothed RMS threshold (0.0 to 1.0) for entering and leaving speech.
    pub energy_threshold: f32,

    /// Stream time after which the scan gives up.
    pub max_scan_duration: Duration,

    /// Samples per analysis chunk.
    pub chunk_size: usize,

    /// Number of chunks averaged into the smoothed loudness.
    pub smoothing_window: usize,

    /// Pauses up to this long are absorbed when merging segments.
    pub merge_gap: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::thorough()
    }
}

impl SamplerConfig {
    /// Long target, fine chunking.
    pub fn thorough() -> Self {
        Self {
            target_speech_duration: Duration::from_secs(60),
            min_segment_duration: Duration::from_millis(500),
            sample_rate: 16_000,
            energy_threshold: 0.02,
            max_scan_duration: Duration::from_secs(300),
            chunk_size: 1024,
            smoothing_window: 5,
            merge_gap: Duration::from_millis(500),
        }
    }

    /// Shorter target, coarser chunking and a higher threshold.
    pub fn fast() -> Self {
        Self {
            target_speech_duration: Duration::from_secs(30),
            min_segment_duration: Duration::from_millis(500),
            sample_rate: 16_000,
            energy_threshold: 0.03,
            max_scan_duration: Duration::from_secs(120),
            chunk_size: 4096,
            smoothing_window: 5,
            merge_gap: Duration::from_millis(500),
        }
    }

    pub fn from_preset(preset: Preset) -> Self {
        match preset {
            Preset::Thorough => Self::thorough(),
            Preset::Fast => Self::fast(),
        }
    }

    /// Duration of one analysis chunk.
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate as f64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SamplerError::Config(
                "Sample rate must be greater than 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(SamplerError::Config(
                "Chunk size must be greater than 0".to_string(),
            ));
        }
        if self.smoothing_window == 0 {
            return Err(SamplerError::Config(
                "Smoothing window must be greater than 0".to_string(),
            ));
        }
        if !(self.energy_threshold > 0.0 && self.energy_threshold < 1.0) {
            return Err(SamplerError::Config(format!(
                "Energy threshold must be in (0, 1), got {}",
                self.energy_threshold
            )));
        }
        if self.target_speech_duration.is_zero() {
            return Err(SamplerError::Config(
                "Target speech duration must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for planning sampling windows over long media.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    /// Length of each planned window.
    pub short_clip_duration: Duration,

    /// Upper bound on planned windows per source.
    pub max_clips: usize,

    /// Upper bound on total planned audio per source.
    pub max_total_audio: Duration,

    /// Sources at or below this length are sampled as one window from 0.
    pub short_media_threshold: Duration,

    /// Distance from the end of the source to the last candidate window.
    pub end_offset: Duration,

    /// Windows shorter than this are not worth extracting.
    pub min_clip_duration: Duration,

    /// Attempt timeout when the source duration cannot be determined.
    pub whole_file_timeout: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            short_clip_duration: Duration::from_secs(30),
            max_clips: 5,
            max_total_audio: Duration::from_secs(90),
            short_media_threshold: Duration::from_secs(300),
            end_offset: Duration::from_secs(60),
            min_clip_duration: Duration::from_secs(5),
            whole_file_timeout: Duration::from_secs(120),
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_clips == 0 {
            return Err(SamplerError::Config(
                "Max clips must be greater than 0".to_string(),
            ));
        }
        if self.short_clip_duration.is_zero() || self.max_total_audio.is_zero() {
            return Err(SamplerError::Config(
                "Clip and total audio durations must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed per strategy for transient failures.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base_delay * 2^retry`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Settings of the hosting application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub preset: Preset,
    pub concurrency: usize,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub max_retries: u32,
    pub refine_speech: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preset: Preset::default(),
            concurrency: 2,
            ffmpeg_path: None,
            ffprobe_path: None,
            temp_dir: None,
            max_retries: 2,
            refine_speech: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        // Load from config file if it exists
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let contents = std::fs::read_to_string(&config_path)?;
                config = toml::from_str::<Config>(&contents).map_err(|e| {
                    SamplerError::Config(format!("{}: {e}", config_path.display()))
                })?;
            }
        }

        // Override with environment variables
        if let Ok(preset) = std::env::var("SPEECHCLIP_PRESET") {
            if let Ok(p) = preset.parse() {
                config.preset = p;
            }
        }
        if let Ok(concurrency) = std::env::var("SPEECHCLIP_CONCURRENCY") {
            if let Ok(c) = concurrency.parse() {
                config.concurrency = c;
            }
        }
        if let Ok(path) = std::env::var("SPEECHCLIP_FFMPEG") {
            config.ffmpeg_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("SPEECHCLIP_FFPROBE") {
            config.ffprobe_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("SPEECHCLIP_TEMP_DIR") {
            config.temp_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(SamplerError::Config(
                "Concurrency must be greater than 0".to_string(),
            ));
        }
        self.sampler_config().validate()
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig::from_preset(self.preset)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("speechclip").join("config.toml"))
    }
}
