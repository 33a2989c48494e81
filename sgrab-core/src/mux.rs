use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::drm::ContentKey;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("muxer produced no output at {path}")]
    OutputMissing { path: PathBuf },
    #[error("decryption produced no output at {path}")]
    DecryptFailed { path: PathBuf },
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

#[derive(Debug, Clone)]
pub struct MuxPaths {
    pub ffmpeg: PathBuf,
    pub mp4decrypt: PathBuf,
}

impl Default for MuxPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            mp4decrypt: PathBuf::from("mp4decrypt"),
        }
    }
}

/// One downloaded sidecar track handed to the muxer.
#[derive(Debug, Clone)]
pub struct MediaTrackFile {
    pub path: PathBuf,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct MuxOutcome {
    pub final_path: PathBuf,
    pub duration_s: Option<f64>,
}

/// Drives the external muxer: stream-copy the downloaded tracks into the
/// target container, tag language metadata, verify the result, and chain
/// the `*_with_audio` / `*_final` intermediates. CENC inputs are handed
/// to `mp4decrypt` first.
#[derive(Clone)]
pub struct MuxController {
    paths: MuxPaths,
    executor: Arc<dyn CommandExecutor>,
}

impl MuxController {
    pub fn new(paths: MuxPaths, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            paths,
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
        }
    }

    /// `mp4decrypt --key KID:KEY [--key ...] <in> <out>`; the output must
    /// exist and be non-empty.
    pub async fn decrypt_cenc(
        &self,
        keys: &[ContentKey],
        input: &Path,
        output: &Path,
    ) -> Result<(), MuxError> {
        let mut args = Vec::new();
        for key in keys {
            args.push("--key".to_string());
            args.push(key.to_string());
        }
        args.push(input.to_string_lossy().to_string());
        args.push(output.to_string_lossy().to_string());

        self.run_tool(&self.paths.mp4decrypt, &args).await?;
        if !is_non_empty_file(output).await {
            return Err(MuxError::DecryptFailed {
                path: output.to_path_buf(),
            });
        }
        info!(input = %input.display(), output = %output.display(), "CENC payload decrypted");
        Ok(())
    }

    /// Mux the video with its audio and subtitle tracks. Stages are
    /// chained: audio first into `<stem>_with_audio.<ext>`, subtitles
    /// into `<stem>_final.<ext>`, each successful stage deleting its
    /// predecessor intermediate.
    pub async fn mux(
        &self,
        video: &Path,
        audio: &[MediaTrackFile],
        subtitles: &[MediaTrackFile],
        output: &Path,
    ) -> Result<MuxOutcome, MuxError> {
        let extension = output
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_else(|| "mp4".to_string());
        let stem = output
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let dir = output.parent().unwrap_or_else(|| Path::new("."));

        if audio.is_empty() && subtitles.is_empty() {
            let duration = self.join_video(video, output).await?;
            return Ok(MuxOutcome {
                final_path: output.to_path_buf(),
                duration_s: duration,
            });
        }

        let mut current = video.to_path_buf();
        let mut duration = None;

        if !audio.is_empty() {
            let stage_out = dir.join(format!("{stem}_with_audio.{extension}"));
            duration = self.join_audio(&current, audio, &stage_out).await?;
            current = stage_out;
        }

        if !subtitles.is_empty() {
            let stage_out = dir.join(format!("{stem}_final.{extension}"));
            match self
                .join_subtitles(&current, subtitles, &stage_out, &extension)
                .await
            {
                Ok(stage_duration) => {
                    if current != video && current != stage_out {
                        remove_quietly(&current).await;
                    }
                    duration = stage_duration.or(duration);
                    current = stage_out;
                }
                Err(err) => {
                    // A playable video+audio file beats losing the job to
                    // a subtitle codec mismatch.
                    warn!(error = %err, "subtitle mux failed, keeping the file without subtitles");
                }
            }
        }

        Ok(MuxOutcome {
            final_path: current,
            duration_s: duration,
        })
    }

    async fn join_video(&self, video: &Path, output: &Path) -> Result<Option<f64>, MuxError> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().to_string(),
        ];
        let stderr = self.run_tool(&self.paths.ffmpeg, &args).await?;
        self.verify_output(output).await?;
        Ok(parse_duration(&stderr))
    }

    async fn join_audio(
        &self,
        video: &Path,
        audio: &[MediaTrackFile],
        output: &Path,
    ) -> Result<Option<f64>, MuxError> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
        ];
        for track in audio {
            args.push("-i".to_string());
            args.push(track.path.to_string_lossy().to_string());
        }
        args.push("-map".to_string());
        args.push("0:v".to_string());
        for (index, _) in audio.iter().enumerate() {
            args.push("-map".to_string());
            args.push(format!("{}:a", index + 1));
        }
        args.push("-c".to_string());
        args.push("copy".to_string());
        for (index, track) in audio.iter().enumerate() {
            args.push(format!("-metadata:s:a:{index}"));
            args.push(format!("language={}", track.language));
        }
        args.push(output.to_string_lossy().to_string());

        let stderr = self.run_tool(&self.paths.ffmpeg, &args).await?;
        self.verify_output(output).await?;
        Ok(parse_duration(&stderr))
    }

    async fn join_subtitles(
        &self,
        video: &Path,
        subtitles: &[MediaTrackFile],
        output: &Path,
        extension: &str,
    ) -> Result<Option<f64>, MuxError> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
        ];
        for track in subtitles {
            args.push("-i".to_string());
            args.push(track.path.to_string_lossy().to_string());
        }
        args.push("-map".to_string());
        args.push("0".to_string());
        for (index, _) in subtitles.iter().enumerate() {
            args.push("-map".to_string());
            args.push(format!("{}:0", index + 1));
        }
        args.push("-c".to_string());
        args.push("copy".to_string());
        // WebVTT/SRT does not fit an MP4 container; convert. MKV takes
        // the streams as they are.
        if extension.eq_ignore_ascii_case("mp4") {
            args.push("-c:s".to_string());
            args.push("mov_text".to_string());
        }
        for (index, track) in subtitles.iter().enumerate() {
            args.push(format!("-metadata:s:s:{index}"));
            args.push(format!("language={}", track.language));
        }
        args.push(output.to_string_lossy().to_string());

        let stderr = self.run_tool(&self.paths.ffmpeg, &args).await?;
        self.verify_output(output).await?;
        Ok(parse_duration(&stderr))
    }

    async fn run_tool(&self, program: &Path, args: &[String]) -> Result<String, MuxError> {
        debug!(program = %program.display(), ?args, "running external tool");
        let mut command = Command::new(program);
        for arg in args {
            command.arg(arg);
        }
        let output = self.executor.run(&mut command).await.map_err(MuxError::Io)?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(MuxError::CommandFailure {
                command: format!("{} {}", program.display(), args.join(" ")),
                status: output.status.code(),
                stderr,
            });
        }
        Ok(stderr)
    }

    async fn verify_output(&self, output: &Path) -> Result<(), MuxError> {
        if !is_non_empty_file(output).await {
            return Err(MuxError::OutputMissing {
                path: output.to_path_buf(),
            });
        }
        Ok(())
    }
}

async fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        debug!(path = %path.display(), error = %err, "failed to remove intermediate");
    }
}

/// FFmpeg reports the input duration on stderr as `Duration: HH:MM:SS.cc`.
pub fn parse_duration(stderr: &str) -> Option<f64> {
    let regex = Regex::new(r"Duration:\s*(\d{2}):(\d{2}):(\d{2})\.(\d{1,3})").ok()?;
    let captures = regex.captures(stderr)?;
    let hours: f64 = captures[1].parse().ok()?;
    let minutes: f64 = captures[2].parse().ok()?;
    let seconds: f64 = captures[3].parse().ok()?;
    let fraction = format!("0.{}", &captures[4]).parse::<f64>().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds + fraction)
}
