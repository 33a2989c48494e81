use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::event::DownloadStatus;
use crate::fetch::TrackReport;
use crate::manifest::ManifestKind;
use crate::select::{ExternalSubtitle, SelectionPolicy};

/// Resolved input contract for one download job. Site scraping, prompts
/// and config loading happen upstream; the engine receives this value.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub manifest_url: String,
    pub license_url: Option<String>,
    pub license_headers: HashMap<String, String>,
    pub license_query_params: Vec<(String, String)>,
    /// Raw `KID:KEY` that bypasses the license exchange entirely.
    pub raw_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub output_path: PathBuf,
    pub external_subtitles: Vec<ExternalSubtitle>,
    pub selection: SelectionPolicy,
    /// Pre-extracted manifest text from an upstream scraper. When set,
    /// the first download attempt parses this against a base-url derived
    /// from `manifest_url`; a 404 during download flips the job to a
    /// fresh origin fetch.
    pub raw_manifest: Option<String>,
}

impl DownloadRequest {
    pub fn new(manifest_url: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            license_url: None,
            license_headers: HashMap::new(),
            license_query_params: Vec::new(),
            raw_key: None,
            headers: HashMap::new(),
            output_path: output_path.into(),
            external_subtitles: Vec::new(),
            selection: SelectionPolicy::default(),
            raw_manifest: None,
        }
    }
}

/// Per-job temp directory layout, rooted next to the final output file.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub output_path: PathBuf,
    pub output_dir: PathBuf,
    pub name: String,
    pub root: PathBuf,
}

impl JobPaths {
    pub fn new(output_path: &Path) -> Self {
        let output_dir = output_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = output_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        let root = output_dir.join(format!("{name}_tmp"));
        Self {
            output_path: output_path.to_path_buf(),
            output_dir,
            name,
            root,
        }
    }

    pub fn video(&self, extension: &str) -> PathBuf {
        self.root.join(format!("{}.video.{extension}", self.name))
    }

    pub fn audio(&self, language: &str) -> PathBuf {
        self.root.join(format!("{}.{language}.m4a", self.name))
    }

    pub fn subtitle(&self, language: &str, format: &str) -> PathBuf {
        self.root.join(format!("{}.{language}.{format}", self.name))
    }

    pub fn raw_manifest(&self, kind: ManifestKind) -> PathBuf {
        match kind {
            ManifestKind::Hls => self.root.join("raw.m3u8"),
            ManifestKind::Dash => self.root.join("raw.mpd"),
        }
    }

    pub fn meta(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("log.txt")
    }

    /// Marker suppressing media-library scanners while the job runs.
    pub fn ignore_marker(&self) -> PathBuf {
        self.root.join(".ignore")
    }

    pub fn mux_output(&self, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{extension}", self.name))
    }
}

/// Line-oriented append log inside the job directory.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
}

impl JobLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn line(&self, label: &str, message: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                writeln!(
                    file,
                    "[{}] {label}: {message}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S")
                )
            });
        if let Err(err) = result {
            warn!(path = %self.path.display(), error = %err, "failed to append job log");
        }
    }
}

/// Final job outcome returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub output_path: PathBuf,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub duration_s: Option<f64>,
    pub bytes_total: u64,
    /// Process exit code when the engine is the entry point: 0 success,
    /// 1 transient, 2 permanent, 3 cancelled.
    pub exit_code: i32,
    #[serde(skip)]
    pub tracks: Vec<TrackReport>,
    pub completed_at: chrono::DateTime<Utc>,
}

impl JobReport {
    pub fn new(output_path: PathBuf, status: DownloadStatus) -> Self {
        let exit_code = match status {
            DownloadStatus::Cancelled => 3,
            DownloadStatus::Failed => 1,
            _ => 0,
        };
        Self {
            output_path,
            status,
            error: None,
            duration_s: None,
            bytes_total: 0,
            exit_code,
            tracks: Vec::new(),
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_paths_layout() {
        let paths = JobPaths::new(Path::new("/downloads/Show.S01E01.mp4"));
        assert_eq!(paths.name, "Show.S01E01");
        assert_eq!(paths.root, PathBuf::from("/downloads/Show.S01E01_tmp"));
        assert_eq!(
            paths.video("ts"),
            PathBuf::from("/downloads/Show.S01E01_tmp/Show.S01E01.video.ts")
        );
        assert_eq!(
            paths.audio("it"),
            PathBuf::from("/downloads/Show.S01E01_tmp/Show.S01E01.it.m4a")
        );
        assert_eq!(
            paths.raw_manifest(ManifestKind::Dash),
            PathBuf::from("/downloads/Show.S01E01_tmp/raw.mpd")
        );
        assert!(paths
            .ignore_marker()
            .to_string_lossy()
            .ends_with("/.ignore"));
    }

    #[test]
    fn job_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::new(dir.path().join("log.txt"));
        log.line("INFO", "starting");
        log.line("ERROR", "segment 4 failed");
        let contents = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("INFO: starting"));
        assert!(lines[1].contains("ERROR: segment 4 failed"));
    }
}
