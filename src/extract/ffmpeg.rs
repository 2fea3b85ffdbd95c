use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::audio::AudioMetadata;
use crate::error::{Result, SamplerError};

use super::{verify_artifact, ExtractionBackend, ExtractionJob};

const NAME: &str = "ffmpeg";

/// Containers the built-in decoder handles poorly.
const PREFERRED_FORMATS: &[&str] = &[
    "avi", "wmv", "asf", "flv", "mpg", "mpeg", "vob", "ts", "m2ts", "mts", "3gp", "rm", "rmvb",
    "divx", "ogv",
];

/// Timeout for `ffprobe` duration queries.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Lines of stderr kept as diagnostic text.
const DIAGNOSTIC_LINES: usize = 12;

/// Backend driving an external `ffmpeg` process.
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    detected: OnceCell<Option<PathBuf>>,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegBackend {
    /// Use `ffmpeg` and `ffprobe` from `PATH`.
    pub fn new() -> Self {
        Self::with_paths("ffmpeg", "ffprobe")
    }

    pub fn with_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            detected: OnceCell::new(),
        }
    }

    /// Resolve the tool once; later calls reuse the cached answer.
    async fn tool(&self) -> Option<&Path> {
        self.detected
            .get_or_init(|| detect(&self.ffmpeg))
            .await
            .as_deref()
    }

    fn build_args(job: &ExtractionJob<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-loglevel", "error", "-y"]
            .iter()
            .map(OsString::from)
            .collect();

        let start = job.target.start();
        if !start.is_zero() {
            args.push("-ss".into());
            args.push(format!("{:.3}", start.as_secs_f64()).into());
        }

        args.push("-i".into());
        args.push(job.source.path.as_os_str().to_os_string());

        if let Some(length) = job.target.length() {
            args.push("-t".into());
            args.push(format!("{:.3}", length.as_secs_f64()).into());
        }

        for arg in ["-map", "0:a:0", "-vn", "-sn", "-dn", "-acodec", "pcm_s16le", "-ar"] {
            args.push(arg.into());
        }
        args.push(job.sample_rate.to_string().into());
        for arg in ["-ac", "1", "-f", "wav"] {
            args.push(arg.into());
        }
        args.push(job.output.as_os_str().to_os_string());
        args
    }
}

async fn detect(program: &Path) -> Option<PathBuf> {
    let status = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;

    match status {
        Ok(s) if s.success() => {
            debug!("{} is available", program.display());
            Some(program.to_path_buf())
        }
        Ok(s) => {
            warn!("{} -version exited with {}", program.display(), s);
            None
        }
        Err(e) => {
            debug!("{} not found: {}", program.display(), e);
            None
        }
    }
}

enum Wait {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to signal ffmpeg: {}", e);
    }
    let _ = child.wait().await;
}

/// Keep the tail of stderr; the last lines carry the actual error.
fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let skip = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines[skip..].join("\n")
}

#[async_trait]
impl ExtractionBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn is_available(&self) -> bool {
        self.tool().await.is_some()
    }

    fn preferred_formats(&self) -> &[&'static str] {
        PREFERRED_FORMATS
    }

    async fn extract(&self, job: &ExtractionJob<'_>) -> Result<AudioMetadata> {
        let tool = self.tool().await.ok_or_else(|| SamplerError::BackendUnavailable {
            backend: NAME.to_string(),
            reason: format!("{} not found", self.ffmpeg.display()),
        })?;

        if !job.source.path.exists() {
            return Err(SamplerError::FileNotFound(job.source.path.display().to_string()));
        }

        debug!(
            "ffmpeg: {} from {:.3}s for {:?} (timeout {:?})",
            job.source.path.display(),
            job.target.start().as_secs_f64(),
            job.target.length(),
            job.timeout
        );

        let mut child = Command::new(tool)
            .args(Self::build_args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SamplerError::ExtractionFailed {
                backend: NAME.to_string(),
                diagnostic: format!("failed to spawn ffmpeg: {e}"),
            })?;

        // Drain stderr concurrently so a chatty process never blocks on a full pipe.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        let waited = tokio::select! {
            res = tokio::time::timeout(job.timeout, child.wait()) => match res {
                Ok(status) => Wait::Exited(status),
                Err(_) => Wait::TimedOut,
            },
            _ = job.cancel.cancelled() => Wait::Cancelled,
        };

        let status = match waited {
            Wait::Exited(status) => status?,
            Wait::TimedOut => {
                warn!(
                    "ffmpeg exceeded {:?} on {}, terminating",
                    job.timeout,
                    job.source.path.display()
                );
                terminate(&mut child).await;
                stderr_task.abort();
                return Err(SamplerError::Timeout {
                    backend: NAME.to_string(),
                    timeout: job.timeout,
                });
            }
            Wait::Cancelled => {
                info!("ffmpeg cancelled on {}", job.source.path.display());
                terminate(&mut child).await;
                stderr_task.abort();
                return Err(SamplerError::Cancelled);
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let diagnostic = tail(&stderr);
            return Err(SamplerError::ExtractionFailed {
                backend: NAME.to_string(),
                diagnostic: if diagnostic.is_empty() {
                    format!("ffmpeg exited with {status}")
                } else {
                    diagnostic
                },
            });
        }

        verify_artifact(NAME, job.output, job.sample_rate).map_err(|e| match e {
            SamplerError::OutputMissing { backend, diagnostic } if !stderr.trim().is_empty() => {
                SamplerError::OutputMissing {
                    backend,
                    diagnostic: format!("{diagnostic}\n{}", tail(&stderr)),
                }
            }
            other => other,
        })
    }

    async fn probe_duration(&self, source: &Path) -> Result<Option<Duration>> {
        let mut command = Command::new(&self.ffprobe);
        command
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(source)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, command.output())
            .await
            .map_err(|_| SamplerError::Timeout {
                backend: "ffprobe".to_string(),
                timeout: PROBE_TIMEOUT,
            })?
            .map_err(|e| SamplerError::BackendUnavailable {
                backend: "ffprobe".to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SamplerError::ExtractionFailed {
                backend: "ffprobe".to_string(),
                diagnostic: tail(&stderr),
            });
        }

        let duration_str = String::from_utf8_lossy(&output.stdout);
        match duration_str.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ClipPosition, SourceMedia};
    use crate::extract::ExtractionTarget;
    use tokio_util::sync::CancellationToken;

    fn ffmpeg_available() -> bool {
        std::process::Command::new("ffmpeg")
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn args_of(target: ExtractionTarget) -> Vec<String> {
        let source = SourceMedia::new("/videos/talk.mp4");
        let cancel = CancellationToken::new();
        let job = ExtractionJob {
            source: &source,
            target,
            output: Path::new("/tmp/out.wav"),
            sample_rate: 16_000,
            timeout: Duration::from_secs(30),
            cancel: &cancel,
        };
        FfmpegBackend::build_args(&job)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_clip_args_seek_before_input() {
        let args = args_of(ExtractionTarget::Clip(ClipPosition {
            start: Duration::from_secs(900),
            duration: Duration::from_secs(30),
            index: 1,
        }));
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "900.000");
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "30.000");
        assert!(args.windows(2).any(|w| w[0] == "-ar" && w[1] == "16000"));
        assert!(args.windows(2).any(|w| w[0] == "-ac" && w[1] == "1"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.wav"));
    }

    #[test]
    fn test_whole_file_args_have_no_seek() {
        let args = args_of(ExtractionTarget::WholeFile { limit: None });
        assert!(!args.iter().any(|a| a == "-ss"));
        assert!(!args.iter().any(|a| a == "-t"));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let stderr: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let tail = tail(&stderr);
        assert_eq!(tail.lines().count(), DIAGNOSTIC_LINES);
        assert!(tail.ends_with("line 29"));
    }

    #[test]
    fn test_prefers_legacy_containers() {
        let backend = FfmpegBackend::new();
        assert!(backend.preferred_formats().contains(&"avi"));
        assert!(!backend.preferred_formats().contains(&"wav"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let backend = FfmpegBackend::with_paths(
            "/nonexistent/bin/ffmpeg-missing",
            "/nonexistent/bin/ffprobe-missing",
        );
        assert!(!backend.is_available().await);
        // Cached answer is reused.
        assert!(!backend.is_available().await);
    }

    #[tokio::test]
    async fn test_detects_installed_ffmpeg() {
        if !ffmpeg_available() {
            eprintln!("Skipping test: FFmpeg not available");
            return;
        }
        assert!(FfmpegBackend::new().is_available().await);
    }

    #[tokio::test]
    async fn test_extract_file_not_found() {
        if !ffmpeg_available() {
            eprintln!("Skipping test: FFmpeg not available");
            return;
        }
        let source = SourceMedia::new("/nonexistent/file.mp4");
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.wav");
        let job = ExtractionJob {
            source: &source,
            target: ExtractionTarget::WholeFile { limit: None },
            output: &output,
            sample_rate: 16_000,
            timeout: Duration::from_secs(30),
            cancel: &cancel,
        };
        let result = FfmpegBackend::new().extract(&job).await;
        assert!(matches!(result, Err(SamplerError::FileNotFound(_))));
    }
}
