use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use hound::{SampleFormat, WavReader, WavWriter};
use tracing::{debug, info};

use crate::config::SamplerConfig;
use crate::error::Result;

use super::energy::EnergyAnalyzer;
use super::{AudioMetadata, TimeRange};

/// Two-state speech/silence detector over smoothed loudness.
///
/// A single threshold is used both to enter and to leave speech.
#[derive(Debug, Clone)]
pub struct SpeechSegmenter {
    threshold: f32,
    min_segment: Duration,
    target: Duration,
    max_scan: Duration,
    speech_start: Option<Duration>,
    collected: Duration,
    elapsed: Duration,
}

impl SpeechSegmenter {
    pub fn new(config: &SamplerConfig) -> Self {
        Self {
            threshold: config.energy_threshold,
            min_segment: config.min_segment_duration,
            target: config.target_speech_duration,
            max_scan: config.max_scan_duration,
            speech_start: None,
            collected: Duration::ZERO,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether the speech target or the scan limit has been reached.
    pub fn is_done(&self) -> bool {
        self.collected >= self.target || self.elapsed >= self.max_scan
    }

    pub fn is_in_speech(&self) -> bool {
        self.speech_start.is_some()
    }

    /// Total duration of emitted segments.
    pub fn collected(&self) -> Duration {
        self.collected
    }

    /// Stream time consumed so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Feed the smoothed loudness of the next chunk, which lasts `chunk_duration`.
    pub fn push(&mut self, smoothed: f32, chunk_duration: Duration) -> Option<TimeRange> {
        let now = self.elapsed;
        self.elapsed += chunk_duration;

        match self.speech_start {
            None if smoothed > self.threshold => {
                self.speech_start = Some(now);
                None
            }
            Some(start) if smoothed <= self.threshold => {
                self.speech_start = None;
                self.close(start, now)
            }
            _ => None,
        }
    }

    /// Close a segment left open at end of stream.
    pub fn finish(&mut self) -> Option<TimeRange> {
        let start = self.speech_start.take()?;
        self.close(start, self.elapsed)
    }

    fn close(&mut self, start: Duration, end: Duration) -> Option<TimeRange> {
        let segment = TimeRange::new(start, end);
        if segment.duration() < self.min_segment {
            debug!(
                "Discarding {:.3}s blip at {:.3}s",
                segment.duration().as_secs_f64(),
                start.as_secs_f64()
            );
            return None;
        }
        self.collected += segment.duration();
        Some(segment)
    }
}

/// Outcome of scanning a stream for speech.
#[derive(Debug, Clone, Default)]
pub struct SpeechScan {
    pub segments: Vec<TimeRange>,
    /// Stream time consumed before the scan stopped.
    pub scanned: Duration,
}

impl SpeechScan {
    pub fn speech_duration(&self) -> Duration {
        total_speech_duration(&self.segments)
    }
}

struct SpeechScanner {
    analyzer: EnergyAnalyzer,
    segmenter: SpeechSegmenter,
    segments: Vec<TimeRange>,
    sample_rate: u32,
}

impl SpeechScanner {
    fn new(config: &SamplerConfig, sample_rate: u32) -> Self {
        Self {
            analyzer: EnergyAnalyzer::new(config.smoothing_window),
            segmenter: SpeechSegmenter::new(config),
            segments: Vec::new(),
            sample_rate: sample_rate.max(1),
        }
    }

    /// Returns `false` once the scan budget is spent.
    fn feed(&mut self, chunk: &[f32]) -> bool {
        if self.segmenter.is_done() {
            return false;
        }
        let frame = self.analyzer.push(chunk);
        let chunk_duration = Duration::from_secs_f64(chunk.len() as f64 / self.sample_rate as f64);
        if let Some(segment) = self.segmenter.push(frame.smoothed, chunk_duration) {
            self.segments.push(segment);
        }
        !self.segmenter.is_done()
    }

    fn finish(mut self) -> SpeechScan {
        if let Some(segment) = self.segmenter.finish() {
            self.segments.push(segment);
        }
        SpeechScan {
            segments: self.segments,
            scanned: self.segmenter.elapsed(),
        }
    }
}

/// Segment an in-memory sequence of mono chunks sampled at `config.sample_rate`.
pub fn segment_chunks<'a, I>(chunks: I, config: &SamplerConfig) -> SpeechScan
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut scanner = SpeechScanner::new(config, config.sample_rate);
    for chunk in chunks {
        if !scanner.feed(chunk) {
            break;
        }
    }
    scanner.finish()
}

/// Detect speech regions in a WAV file, reading it chunk by chunk.
///
/// Reading stops as soon as the speech target or the scan limit is reached.
pub fn detect_speech_regions(audio_path: &Path, config: &SamplerConfig) -> Result<SpeechScan> {
    let mut reader = WavReader::open(audio_path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    debug!(
        "Scanning {}: {} Hz, {} channels, {} bits",
        audio_path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );

    let mut scanner = SpeechScanner::new(config, spec.sample_rate);
    let mut frame = Vec::with_capacity(channels);
    let mut chunk = Vec::with_capacity(config.chunk_size);

    let mut on_sample = |sample: f32, chunk: &mut Vec<f32>| -> bool {
        frame.push(sample);
        if frame.len() < channels {
            return true;
        }
        chunk.push(frame.iter().sum::<f32>() / channels as f32);
        frame.clear();
        if chunk.len() < config.chunk_size {
            return true;
        }
        let more = scanner.feed(chunk);
        chunk.clear();
        more
    };

    match spec.sample_format {
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            for sample in reader.samples::<i32>() {
                if !on_sample(sample? as f32 / scale, &mut chunk) {
                    break;
                }
            }
        }
        SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                if !on_sample(sample?, &mut chunk) {
                    break;
                }
            }
        }
    }

    if !chunk.is_empty() {
        scanner.feed(&chunk);
    }
    let scan = scanner.finish();

    info!(
        "Detected {} speech segments ({:.2}s) in {:.2}s of audio",
        scan.segments.len(),
        scan.speech_duration().as_secs_f64(),
        scan.scanned.as_secs_f64()
    );

    Ok(scan)
}

/// Copy the given ranges of a WAV file, back to back, into a new WAV file.
pub fn write_speech_segments(
    input: &Path,
    segments: &[TimeRange],
    output: &Path,
) -> Result<AudioMetadata> {
    let mut reader: WavReader<BufReader<File>> = WavReader::open(input)?;
    let spec = reader.spec();
    let total_frames = reader.duration();
    let channels = spec.channels.max(1) as usize;
    let mut writer = WavWriter::create(output, spec)?;
    let mut written_frames: u64 = 0;

    for segment in segments {
        let start = to_frames(segment.start, spec.sample_rate).min(total_frames);
        let end = to_frames(segment.end, spec.sample_rate).min(total_frames);
        if end <= start {
            continue;
        }
        reader.seek(start)?;
        let count = (end - start) as usize * channels;

        match spec.sample_format {
            SampleFormat::Int => {
                for sample in reader.samples::<i32>().take(count) {
                    writer.write_sample(sample?)?;
                }
            }
            SampleFormat::Float => {
                for sample in reader.samples::<f32>().take(count) {
                    writer.write_sample(sample?)?;
                }
            }
        }
        written_frames += (end - start) as u64;
    }

    writer.finalize()?;

    let duration = Duration::from_secs_f64(written_frames as f64 / spec.sample_rate.max(1) as f64);
    debug!(
        "Wrote {} speech segments ({:.2}s) to {}",
        segments.len(),
        duration.as_secs_f64(),
        output.display()
    );

    Ok(AudioMetadata {
        duration,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

fn to_frames(time: Duration, sample_rate: u32) -> u32 {
    (time.as_secs_f64() * sample_rate as f64).round() as u32
}

/// Get total speech duration from detected regions.
pub fn total_speech_duration(regions: &[TimeRange]) -> Duration {
    regions.iter().map(|r| r.duration()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavSpec;

    fn config() -> SamplerConfig {
        SamplerConfig {
            target_speech_duration: Duration::from_secs(60),
            min_segment_duration: Duration::from_millis(300),
            sample_rate: 1000,
            energy_threshold: 0.1,
            max_scan_duration: Duration::from_secs(600),
            chunk_size: 100,
            smoothing_window: 1,
            merge_gap: Duration::from_millis(200),
        }
    }

    fn chunk_of(level: f32) -> Vec<f32> {
        vec![level; 100]
    }

    fn pattern(levels: &[f32]) -> Vec<Vec<f32>> {
        levels.iter().map(|&l| chunk_of(l)).collect()
    }

    #[test]
    fn test_segmenter_basic_transitions() {
        let config = config();
        let mut segmenter = SpeechSegmenter::new(&config);
        let chunk = Duration::from_millis(100);

        assert!(segmenter.push(0.0, chunk).is_none());
        assert!(!segmenter.is_in_speech());
        for _ in 0..5 {
            assert!(segmenter.push(0.5, chunk).is_none());
        }
        assert!(segmenter.is_in_speech());

        let segment = segmenter.push(0.0, chunk).expect("segment closes on silence");
        assert_eq!(segment.start, Duration::from_millis(100));
        assert_eq!(segment.end, Duration::from_millis(600));
        assert_eq!(segmenter.collected(), Duration::from_millis(500));
    }

    #[test]
    fn test_threshold_is_exclusive_for_speech() {
        let config = config();
        let mut segmenter = SpeechSegmenter::new(&config);
        segmenter.push(config.energy_threshold, Duration::from_millis(100));
        assert!(!segmenter.is_in_speech());
    }

    #[test]
    fn test_short_blips_are_discarded() {
        let chunks = pattern(&[0.0, 0.5, 0.5, 0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0]);
        let scan = segment_chunks(chunks.iter().map(Vec::as_slice), &config());

        assert_eq!(scan.segments.len(), 1);
        assert_eq!(scan.segments[0].start, Duration::from_millis(500));
        assert_eq!(scan.segments[0].end, Duration::from_millis(900));
    }

    #[test]
    fn test_open_segment_closed_at_end_of_stream() {
        let chunks = pattern(&[0.0, 0.5, 0.5, 0.5, 0.5]);
        let scan = segment_chunks(chunks.iter().map(Vec::as_slice), &config());

        assert_eq!(scan.segments.len(), 1);
        assert_eq!(scan.segments[0].end, Duration::from_millis(500));
        assert_eq!(scan.scanned, Duration::from_millis(500));
    }

    #[test]
    fn test_stops_when_target_reached() {
        let config = SamplerConfig {
            target_speech_duration: Duration::from_millis(400),
            ..config()
        };
        let chunks = pattern(&[0.5, 0.5, 0.5, 0.5, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.5, 0.5]);
        let scan = segment_chunks(chunks.iter().map(Vec::as_slice), &config);

        assert_eq!(scan.segments.len(), 1);
        assert_eq!(scan.scanned, Duration::from_millis(500));
    }

    #[test]
    fn test_silence_ends_at_max_scan() {
        let config = SamplerConfig {
            max_scan_duration: Duration::from_secs(1),
            ..config()
        };
        let chunks = pattern(&[0.0; 50]);
        let scan = segment_chunks(chunks.iter().map(Vec::as_slice), &config);

        assert!(scan.segments.is_empty());
        assert_eq!(scan.scanned, Duration::from_secs(1));
    }

    #[test]
    fn test_total_speech_duration() {
        let regions = vec![
            TimeRange::new(Duration::from_secs(0), Duration::from_secs(5)),
            TimeRange::new(Duration::from_secs(10), Duration::from_secs(15)),
        ];
        assert_eq!(total_speech_duration(&regions), Duration::from_secs(10));
    }

    fn write_test_wav(path: &Path, levels: &[i16], per_level: usize) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 1000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &level in levels {
            for i in 0..per_level {
                let sample = if i % 2 == 0 { level } else { -level };
                writer.write_sample(sample).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_detect_speech_regions_from_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        write_test_wav(&path, &[0, 16000, 16000, 16000, 16000, 0, 0], 100);

        let scan = detect_speech_regions(&path, &config()).unwrap();
        assert_eq!(scan.segments.len(), 1);
        assert_eq!(scan.segments[0].start, Duration::from_millis(100));
        assert_eq!(scan.segments[0].end, Duration::from_millis(500));
    }

    #[test]
    fn test_write_speech_segments() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.wav");
        write_test_wav(&input, &[0, 100, 0, 200, 0], 1000);

        let segments = vec![
            TimeRange::new(Duration::from_secs(1), Duration::from_secs(2)),
            TimeRange::new(Duration::from_secs(3), Duration::from_secs(4)),
        ];
        let metadata = write_speech_segments(&input, &segments, &output).unwrap();
        assert_eq!(metadata.duration, Duration::from_secs(2));

        let reader = WavReader::open(&output).unwrap();
        assert_eq!(reader.duration(), 2000);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples[0].abs(), 100);
        assert_eq!(samples[1999].abs(), 200);
    }
}
