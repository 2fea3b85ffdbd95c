//! Built-in extraction backend on top of Symphonia.
//!
//! Decoding runs on a blocking thread:
//! - demux + decode the first decodable audio track
//! - downmix to mono and resample to the requested rate
//! - write 16-bit PCM WAV with `hound`
//!
//! The async side enforces the timeout. A timed-out or cancelled decode is
//! abandoned and told to stop through a shared flag checked before the output
//! is created and once per packet. An abandoned decode removes its output.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo, Track};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

use crate::audio::AudioMetadata;
use crate::error::{Result, SamplerError};
use crate::resources::StopSignal;

use super::{verify_artifact, ExtractionBackend, ExtractionJob};

const NAME: &str = "native";

const PREFERRED_FORMATS: &[&str] = &["wav", "flac"];

/// Source frames fed to the resampler per call.
const RESAMPLER_CHUNK: usize = 1024;

/// Backend decoding media in-process.
#[derive(Debug, Default, Clone)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
struct TranscodeParams {
    source: PathBuf,
    hint: Option<String>,
    start: Duration,
    length: Option<Duration>,
    output: PathBuf,
    sample_rate: u32,
}

enum Wait {
    Finished(std::result::Result<Result<AudioMetadata>, tokio::task::JoinError>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ExtractionBackend for NativeBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn preferred_formats(&self) -> &[&'static str] {
        PREFERRED_FORMATS
    }

    async fn extract(&self, job: &ExtractionJob<'_>) -> Result<AudioMetadata> {
        if !job.source.path.exists() {
            return Err(SamplerError::FileNotFound(job.source.path.display().to_string()));
        }

        let params = TranscodeParams {
            source: job.source.path.clone(),
            hint: job.source.format.clone(),
            start: job.target.start(),
            length: job.target.length(),
            output: job.output.to_path_buf(),
            sample_rate: job.sample_rate,
        };

        let stop = StopSignal::new();
        // Raised before the caller can delete the output.
        let _guard = stop.raise_on_drop();
        let handle = tokio::task::spawn_blocking(move || {
            stop.run_writing(&params.output, || transcode(&params, &stop))
        });

        let waited = tokio::select! {
            res = tokio::time::timeout(job.timeout, handle) => match res {
                Ok(joined) => Wait::Finished(joined),
                Err(_) => Wait::TimedOut,
            },
            _ = job.cancel.cancelled() => Wait::Cancelled,
        };

        match waited {
            Wait::Finished(Ok(Ok(_))) => verify_artifact(NAME, job.output, job.sample_rate),
            Wait::Finished(Ok(Err(e))) => Err(e),
            Wait::Finished(Err(e)) => Err(SamplerError::HardFailure(format!(
                "decoder task failed: {e}"
            ))),
            Wait::TimedOut => {
                warn!(
                    "native decode exceeded {:?} on {}, abandoning",
                    job.timeout,
                    job.source.path.display()
                );
                Err(SamplerError::Timeout {
                    backend: NAME.to_string(),
                    timeout: job.timeout,
                })
            }
            Wait::Cancelled => Err(SamplerError::Cancelled),
        }
    }

    async fn probe_duration(&self, source: &Path) -> Result<Option<Duration>> {
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let hint = source
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase);
            let (_, track) = open_audio_track(&source, hint.as_deref())?;
            let params = &track.codec_params;
            Ok(match (params.n_frames, params.sample_rate) {
                (Some(frames), Some(rate)) if rate > 0 => {
                    Some(Duration::from_secs_f64(frames as f64 / rate as f64))
                }
                _ => None,
            })
        })
        .await
        .map_err(|e| SamplerError::HardFailure(format!("probe task failed: {e}")))?
    }
}

fn decode_error(context: &str, e: SymphoniaError) -> SamplerError {
    SamplerError::Decode(format!("{context}: {e}"))
}

fn open_audio_track(source: &Path, hint: Option<&str>) -> Result<(Box<dyn FormatReader>, Track)> {
    let file = File::open(source).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SamplerError::FileNotFound(source.display().to_string()),
        _ => SamplerError::Io(e),
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut probe_hint = Hint::new();
    if let Some(ext) = hint {
        probe_hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &probe_hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| decode_error("failed to probe media", e))?;

    let format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .cloned()
        .ok_or_else(|| SamplerError::NoAudioTrack(source.display().to_string()))?;

    Ok((format, track))
}

fn transcode(params: &TranscodeParams, stop: &StopSignal) -> Result<AudioMetadata> {
    let (mut format, track) = open_audio_track(&params.source, params.hint.as_deref())?;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| decode_error("unsupported codec", e))?;

    let src_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| SamplerError::NoAudioTrack(params.source.display().to_string()))?;

    let skip = seek_to_start(format.as_mut(), decoder.as_mut(), &track, params.start);
    let mut skip_frames = (skip.as_secs_f64() * src_rate as f64).round() as u64;
    let mut remaining = params
        .length
        .map(|l| (l.as_secs_f64() * src_rate as f64).round() as u64);

    let spec = WavSpec {
        channels: 1,
        sample_rate: params.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    // Opening the source can stall; don't create an output nobody waits for.
    if stop.is_raised() {
        return Err(SamplerError::Cancelled);
    }
    let mut writer = WavWriter::create(&params.output, spec)?;
    let mut resampler = MonoResampler::new(src_rate, params.sample_rate)?;
    let mut scratch: Option<(usize, SampleBuffer<f32>)> = None;
    let mut resampled = Vec::new();

    while remaining != Some(0) {
        if stop.is_raised() {
            return Err(SamplerError::Cancelled);
        }

        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(decode_error("failed reading packet", e)),
        };
        if packet.track_id() != track.id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(buf) => buf,
            // Corrupted frame; keep going.
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping undecodable frame: {}", e);
                continue;
            }
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(decode_error("decoder failure", e)),
        };

        let mut mono = downmix_to_mono(&decoded, &mut scratch);

        let drop_front = skip_frames.min(mono.len() as u64) as usize;
        skip_frames -= drop_front as u64;
        mono.drain(..drop_front);
        if let Some(left) = remaining.as_mut() {
            let keep = (*left).min(mono.len() as u64);
            mono.truncate(keep as usize);
            *left -= keep;
        }
        if mono.is_empty() {
            continue;
        }

        resampled.clear();
        resampler.push(&mono, &mut resampled)?;
        write_samples(&mut writer, &resampled)?;
    }

    resampled.clear();
    resampler.finish(&mut resampled)?;
    write_samples(&mut writer, &resampled)?;

    let frames = writer.len();
    writer.finalize()?;

    Ok(AudioMetadata {
        duration: Duration::from_secs_f64(frames as f64 / params.sample_rate as f64),
        sample_rate: params.sample_rate,
        channels: 1,
    })
}

/// Seek near `start`; returns how much decoded audio still has to be skipped.
fn seek_to_start(
    format: &mut dyn FormatReader,
    decoder: &mut dyn Decoder,
    track: &Track,
    start: Duration,
) -> Duration {
    if start.is_zero() {
        return Duration::ZERO;
    }

    let time = Time {
        seconds: start.as_secs(),
        frac: start.subsec_nanos() as f64 / 1e9,
    };
    let seeked = format.seek(
        SeekMode::Coarse,
        SeekTo::Time {
            time,
            track_id: Some(track.id),
        },
    );

    match (seeked, track.codec_params.time_base) {
        (Ok(seeked), Some(time_base)) => {
            decoder.reset();
            let actual = time_base.calc_time(seeked.actual_ts);
            let actual = Duration::from_secs_f64(actual.seconds as f64 + actual.frac);
            start.saturating_sub(actual)
        }
        (Ok(_), None) => {
            // No time base to locate the landing point; keep what follows.
            decoder.reset();
            Duration::ZERO
        }
        (Err(e), _) => {
            debug!("Seek failed, decoding from the beginning: {}", e);
            start
        }
    }
}

fn downmix_to_mono(
    decoded: &AudioBufferRef<'_>,
    scratch: &mut Option<(usize, SampleBuffer<f32>)>,
) -> Vec<f32> {
    let spec = *decoded.spec();
    let capacity = decoded.capacity();
    let channels = spec.channels.count().max(1);

    let needs_buffer = !matches!(scratch, Some((cap, _)) if *cap >= capacity);
    if needs_buffer {
        *scratch = Some((capacity, SampleBuffer::<f32>::new(capacity as u64, spec)));
    }
    let Some((_, buf)) = scratch.as_mut() else {
        return Vec::new();
    };
    buf.copy_interleaved_ref(decoded.clone());

    buf.samples()
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn write_samples(writer: &mut WavWriter<std::io::BufWriter<File>>, samples: &[f32]) -> Result<()> {
    for &s in samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    Ok(())
}

/// Mono sample-rate converter; a pass-through when the rates match.
struct MonoResampler {
    inner: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
    ratio: f64,
    consumed: u64,
    produced: u64,
}

impl MonoResampler {
    fn new(src_rate: u32, dst_rate: u32) -> Result<Self> {
        let ratio = dst_rate as f64 / src_rate as f64;
        let inner = if src_rate == dst_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            Some(
                SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK, 1)
                    .map_err(|e| SamplerError::Decode(format!("failed to init resampler: {e}")))?,
            )
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
            ratio,
            consumed: 0,
            produced: 0,
        })
    }

    fn push(&mut self, mono: &[f32], out: &mut Vec<f32>) -> Result<()> {
        let Some(rs) = self.inner.as_mut() else {
            out.extend_from_slice(mono);
            return Ok(());
        };
        self.pending.extend_from_slice(mono);
        self.consumed += mono.len() as u64;

        loop {
            let needed = rs.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            let processed = rs
                .process(&[block], None)
                .map_err(|e| SamplerError::Decode(format!("resampler failed: {e}")))?;
            if let Some(channel) = processed.into_iter().next() {
                self.produced += channel.len() as u64;
                out.extend(channel);
            }
        }
        Ok(())
    }

    /// Flush buffered input, trimming the zero padding back off.
    fn finish(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let Some(rs) = self.inner.as_mut() else {
            return Ok(());
        };
        let expected = (self.consumed as f64 * self.ratio).round() as u64;

        while self.produced < expected {
            let needed = rs.input_frames_next();
            let mut block: Vec<f32> = self.pending.drain(..self.pending.len().min(needed)).collect();
            block.resize(needed, 0.0);
            let processed = rs
                .process(&[block], None)
                .map_err(|e| SamplerError::Decode(format!("resampler failed: {e}")))?;
            let Some(channel) = processed.into_iter().next() else {
                break;
            };
            if channel.is_empty() {
                break;
            }
            let take = (expected - self.produced).min(channel.len() as u64) as usize;
            self.produced += take as u64;
            out.extend_from_slice(&channel[..take]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ClipPosition, SourceMedia};
    use crate::extract::ExtractionTarget;
    use crate::resources::ResourceManager;
    use hound::WavReader;
    use tokio_util::sync::CancellationToken;

    fn write_tone(path: &Path, sample_rate: u32, channels: u16, seconds: u32) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..(sample_rate * seconds) {
            let t = i as f32 / sample_rate as f32;
            let s = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
            for _ in 0..channels {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    async fn run(source: &Path, target: ExtractionTarget, output: &Path) -> Result<AudioMetadata> {
        let source = SourceMedia::new(source);
        let cancel = CancellationToken::new();
        let job = ExtractionJob {
            source: &source,
            target,
            output,
            sample_rate: 16_000,
            timeout: Duration::from_secs(30),
            cancel: &cancel,
        };
        NativeBackend::new().extract(&job).await
    }

    #[test]
    fn test_passthrough_resampler() {
        let mut rs = MonoResampler::new(16_000, 16_000).unwrap();
        let mut out = Vec::new();
        rs.push(&[0.1, 0.2, 0.3], &mut out).unwrap();
        rs.finish(&mut out).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_resampler_output_length() {
        let mut rs = MonoResampler::new(48_000, 16_000).unwrap();
        let mut out = Vec::new();
        rs.push(&vec![0.0; 48_000 + 123], &mut out).unwrap();
        rs.finish(&mut out).unwrap();
        assert_eq!(out.len(), 16_041);
    }

    #[tokio::test]
    async fn test_whole_file_is_downmixed_and_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stereo.wav");
        let output = dir.path().join("out.wav");
        write_tone(&input, 44_100, 2, 2);

        let metadata = run(&input, ExtractionTarget::WholeFile { limit: None }, &output)
            .await
            .unwrap();
        assert_eq!(metadata.sample_rate, 16_000);
        assert_eq!(metadata.channels, 1);
        assert!((metadata.duration.as_secs_f64() - 2.0).abs() < 0.01);

        let reader = WavReader::open(&output).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 16_000);
    }

    #[tokio::test]
    async fn test_clip_extracts_sub_range() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mono.wav");
        let output = dir.path().join("clip.wav");
        write_tone(&input, 16_000, 1, 5);

        let clip = ClipPosition {
            start: Duration::from_secs(1),
            duration: Duration::from_secs(2),
            index: 0,
        };
        let metadata = run(&input, ExtractionTarget::Clip(clip), &output)
            .await
            .unwrap();
        assert_eq!(metadata.duration, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_clip_past_end_is_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("short.wav");
        let output = dir.path().join("clip.wav");
        write_tone(&input, 16_000, 1, 1);

        let clip = ClipPosition {
            start: Duration::from_secs(10),
            duration: Duration::from_secs(2),
            index: 0,
        };
        let err = run(&input, ExtractionTarget::Clip(clip), &output)
            .await
            .unwrap_err();
        assert!(matches!(err, SamplerError::OutputMissing { .. }));
    }

    #[tokio::test]
    async fn test_garbage_input_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("garbage.bin");
        let output = dir.path().join("out.wav");
        std::fs::write(&input, vec![0x42u8; 4096]).unwrap();

        let err = run(&input, ExtractionTarget::WholeFile { limit: None }, &output)
            .await
            .unwrap_err();
        assert!(matches!(err, SamplerError::Decode(_)));
    }

    #[tokio::test]
    async fn test_probe_duration() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tone.wav");
        write_tone(&input, 8_000, 1, 3);

        let duration = NativeBackend::new().probe_duration(&input).await.unwrap();
        assert_eq!(duration, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_stopped_decode_creates_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tone.wav");
        let output = dir.path().join("out.wav");
        write_tone(&input, 16_000, 1, 1);

        let params = TranscodeParams {
            source: input,
            hint: Some("wav".to_string()),
            start: Duration::ZERO,
            length: None,
            output: output.clone(),
            sample_rate: 16_000,
        };
        let stop = StopSignal::new();
        stop.raise();

        let err = stop
            .run_writing(&params.output, || transcode(&params, &stop))
            .unwrap_err();
        assert!(matches!(err, SamplerError::Cancelled));
        assert!(!output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_decode_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("stalled.wav");
        let made = std::process::Command::new("mkfifo").arg(&fifo).status();
        if !matches!(made, Ok(status) if status.success()) {
            eprintln!("Skipping test: mkfifo not available");
            return;
        }

        let resources = ResourceManager::new().unwrap();
        let artifact = resources.allocate("clip00").unwrap();
        let source = SourceMedia::new(&fifo);
        let cancel = CancellationToken::new();
        let job = ExtractionJob {
            source: &source,
            target: ExtractionTarget::WholeFile { limit: None },
            output: artifact.path(),
            sample_rate: 16_000,
            timeout: Duration::from_millis(300),
            cancel: &cancel,
        };

        // Opening a FIFO with no writer blocks the decoder.
        let err = NativeBackend::new().extract(&job).await.unwrap_err();
        assert!(matches!(err, SamplerError::Timeout { .. }));
        drop(artifact);
        assert_eq!(resources.live_artifacts(), 0);

        // Let the stalled decode resume with a valid WAV.
        let mut wav = std::io::Cursor::new(Vec::new());
        {
            let spec = WavSpec {
                channels: 1,
                sample_rate: 16_000,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            };
            let mut writer = WavWriter::new(&mut wav, spec).unwrap();
            for i in 0..8_000u32 {
                writer.write_sample(((i % 64) as i16 - 32) * 200).unwrap();
            }
            writer.finalize().unwrap();
        }
        let fifo_path = fifo.clone();
        tokio::task::spawn_blocking(move || std::fs::write(fifo_path, wav.into_inner()))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(resources.live_artifacts(), 0);
    }
}
