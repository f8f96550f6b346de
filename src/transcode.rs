//! Audio format conversion through an ffmpeg subprocess.
//!
//! Providers return mp3; clients may ask for opus, ogg, or wav. Conversion
//! is best-effort: every caller downgrades to the format it already has when
//! the transcoder is missing or fails.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

use crate::format::AudioFormat;

/// Wall-clock limit for one ffmpeg invocation.
const FFMPEG_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a conversion attempt.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("mp3 is the source format; nothing to convert")]
    UnsupportedTarget,

    #[error("ffmpeg exited with status {0}")]
    Failed(i32),

    #[error("ffmpeg did not finish within {}s", FFMPEG_TIMEOUT.as_secs())]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// ffmpeg wrapper located once at startup.
#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: PathBuf,
}

impl Transcoder {
    /// Locate ffmpeg on PATH. `None` disables conversion for the process.
    pub fn detect() -> Option<Self> {
        match which::which("ffmpeg") {
            Ok(ffmpeg) => Some(Self { ffmpeg }),
            Err(_) => {
                warn!("ffmpeg not found; format conversion unavailable");
                None
            }
        }
    }

    /// Use an explicit ffmpeg binary (tests).
    pub fn with_binary(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }

    /// Convert mp3 bytes to `target`, bounded by a 30s wall clock.
    pub async fn convert(
        &self,
        audio: &[u8],
        target: AudioFormat,
    ) -> Result<Vec<u8>, TranscodeError> {
        if target == AudioFormat::Mp3 {
            return Err(TranscodeError::UnsupportedTarget);
        }

        let mut input = tempfile::Builder::new().suffix(".mp3").tempfile()?;
        input.write_all(audio)?;
        input.flush()?;
        let output = tempfile::Builder::new()
            .suffix(&format!(".{}", target.extension()))
            .tempfile()?;

        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-i")
            .arg(input.path())
            .args(codec_args(target))
            .arg(output.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(FFMPEG_TIMEOUT, command.status())
            .await
            .map_err(|_| TranscodeError::TimedOut)??;
        if !status.success() {
            return Err(TranscodeError::Failed(status.code().unwrap_or(-1)));
        }

        Ok(std::fs::read(output.path())?)
    }
}

/// Encoder arguments per target format.
fn codec_args(target: AudioFormat) -> Vec<&'static str> {
    match target {
        // OGG Opus container tuned for voice messaging.
        AudioFormat::Opus => vec![
            "-c:a", "libopus", "-b:a", "64k", "-ar", "48000", "-ac", "1", "-application", "voip",
            "-f", "ogg",
        ],
        AudioFormat::Ogg => vec!["-c:a", "libvorbis", "-q:a", "4", "-f", "ogg"],
        AudioFormat::Wav => vec!["-f", "wav"],
        AudioFormat::Mp3 => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mp3_target_is_rejected() {
        let transcoder = Transcoder::with_binary(PathBuf::from("/usr/bin/ffmpeg"));
        let err = transcoder.convert(b"bytes", AudioFormat::Mp3).await.expect_err("mp3");
        assert!(matches!(err, TranscodeError::UnsupportedTarget));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_io_error() {
        let transcoder = Transcoder::with_binary(PathBuf::from("/nonexistent/ffmpeg"));
        let err = transcoder.convert(b"bytes", AudioFormat::Wav).await.expect_err("spawn");
        assert!(matches!(err, TranscodeError::Io(_)));
    }

    #[tokio::test]
    async fn failing_command_reports_exit_status() {
        // `false` accepts any arguments and exits 1, standing in for a
        // conversion failure without requiring ffmpeg on the test host.
        let transcoder = Transcoder::with_binary(PathBuf::from("/bin/false"));
        let err = transcoder.convert(b"bytes", AudioFormat::Wav).await.expect_err("exit 1");
        assert!(matches!(err, TranscodeError::Failed(1)));
    }

    #[test]
    fn opus_args_use_ogg_container() {
        let args = codec_args(AudioFormat::Opus);
        assert!(args.contains(&"libopus"));
        assert!(args.contains(&"ogg"));
    }
}
