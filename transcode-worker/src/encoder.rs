//! The external encoder boundary. The worker treats transcoding as a
//! black box: input path, output path, profile in; success or stderr out.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::EncoderError;

/// How much of the encoder's stderr to keep when it fails. ffmpeg logs its
/// whole configuration banner before the actual error.
const STDERR_TAIL_BYTES: usize = 4096;

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Transcode `input` into `output` according to `profile`. Must abort
    /// the underlying work promptly when `cancel` fires.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EncoderError>;
}

/// Resolve a profile identifier to encoder settings: scale filter and
/// video bitrate. The profile table is a configuration concern; these are
/// the built-in profiles.
fn profile_args(profile: &str) -> Option<(&'static str, &'static str)> {
    match profile {
        "480p" => Some(("scale=-2:480", "1000k")),
        "720p" => Some(("scale=-2:720", "2500k")),
        "1080p" => Some(("scale=-2:1080", "5000k")),
        _ => None,
    }
}

/// Invokes ffmpeg as a subprocess.
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EncoderError> {
        let (scale, bitrate) = profile_args(profile)
            .ok_or_else(|| EncoderError::UnknownProfile(profile.to_owned()))?;

        let mut child = Command::new(&self.binary)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vf")
            .arg(scale)
            .arg("-b:v")
            .arg(bitrate)
            .arg("-c:a")
            .arg("aac")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Drain stderr while the encoder runs so a chatty process cannot
        // fill the pipe and deadlock against our wait below.
        let stderr_pipe = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut pipe) = stderr_pipe {
                drop(pipe.read_to_string(&mut buffer).await);
            }
            buffer
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                drop(child.start_kill());
                drop(child.wait().await);
                stderr_reader.abort();
                return Err(EncoderError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if status.success() {
            Ok(())
        } else {
            let stderr = stderr_reader.await.unwrap_or_default();
            Err(EncoderError::Failed {
                code: status.code(),
                stderr: tail(&stderr, STDERR_TAIL_BYTES),
            })
        }
    }
}

fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_owned()
}

/// Scripted stand-in for the encoder: writes a placeholder output file, or
/// fails on configured profiles. Records every invocation.
#[derive(Clone, Default)]
pub struct MockTranscoder {
    fail_profiles: Arc<HashSet<String>>,
    fail_all: bool,
    delay: Option<Duration>,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl MockTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any rendition using one of the given profiles.
    pub fn failing_on(profiles: &[&str]) -> Self {
        Self {
            fail_profiles: Arc::new(profiles.iter().map(|p| p.to_string()).collect()),
            ..Self::default()
        }
    }

    /// Fail every rendition.
    pub fn failing_always() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Sleep for `delay` before producing output, to simulate long encodes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Profiles this mock has been invoked with, in order.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .expect("poisoned MockTranscoder mutex")
            .clone()
    }
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn transcode(
        &self,
        _input: &Path,
        output: &Path,
        profile: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EncoderError> {
        self.invocations
            .lock()
            .expect("poisoned MockTranscoder mutex")
            .push(profile.to_owned());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EncoderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(EncoderError::Cancelled);
        }
        if self.fail_all || self.fail_profiles.contains(profile) {
            return Err(EncoderError::Failed {
                code: Some(1),
                stderr: format!("mock encoder refused profile {}", profile),
            });
        }

        tokio::fs::write(output, format!("transcoded:{}", profile)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_args_known_profiles() {
        assert!(profile_args("480p").is_some());
        assert!(profile_args("720p").is_some());
        assert!(profile_args("1080p").is_some());
        assert!(profile_args("4k").is_none());
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        // 'é' is two bytes; the cut must not land inside it.
        let tailed = tail("aéé", 3);
        assert_eq!(tailed, "éé");
    }

    #[tokio::test]
    async fn test_mock_transcoder_fails_configured_profile() {
        let scratch = tempfile::tempdir().unwrap();
        let output = scratch.path().join("out.mp4");
        let encoder = MockTranscoder::failing_on(&["720p"]);
        let cancel = CancellationToken::new();

        let err = encoder
            .transcode(Path::new("in.mp4"), &output, "720p", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::Failed { .. }));

        encoder
            .transcode(Path::new("in.mp4"), &output, "480p", &cancel)
            .await
            .expect("480p should succeed");
        assert_eq!(encoder.invocations(), vec!["720p", "480p"]);
    }

    #[tokio::test]
    async fn test_mock_transcoder_honors_cancellation() {
        let scratch = tempfile::tempdir().unwrap();
        let output = scratch.path().join("out.mp4");
        let encoder = MockTranscoder::new().with_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = encoder
            .transcode(Path::new("in.mp4"), &output, "480p", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::Cancelled));
    }
}
