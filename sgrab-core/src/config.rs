use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/131.0.0.0 Safari/537.36";

/// Immutable engine configuration. Built once and handed to the
/// orchestrator; components receive the section they need by value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CoreConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub drm: DrmSection,
    #[serde(default)]
    pub output: OutputSection,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.download.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "download.max_retries must be greater than zero".into(),
            ));
        }
        if self.download.video_workers == 0 || self.download.audio_workers == 0 {
            return Err(ConfigError::Invalid(
                "worker counts must be greater than zero".into(),
            ));
        }
        if self.output.extension != "mp4" && self.output.extension != "mkv" {
            return Err(ConfigError::Invalid(format!(
                "unsupported output extension: {}",
                self.output.extension
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub connect_timeout_s: u64,
    pub request_timeout_s: u64,
    pub max_connections: usize,
    pub max_keepalive: usize,
    pub user_agent: String,
    pub impersonate_browser: bool,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            connect_timeout_s: 10,
            request_timeout_s: 30,
            max_connections: 100,
            max_keepalive: 20,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            impersonate_browser: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    pub video_workers: usize,
    pub audio_workers: usize,
    pub max_retries: u32,
    pub segment_timeout_s: u64,
    pub concurrent_download: bool,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            video_workers: 20,
            audio_workers: 8,
            max_retries: 6,
            segment_timeout_s: 20,
            concurrent_download: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrmSection {
    /// System names tried in order: "widevine", "playready", "fairplay".
    pub preference: Vec<String>,
    pub license_timeout_s: u64,
}

impl Default for DrmSection {
    fn default() -> Self {
        Self {
            preference: vec![
                "widevine".to_string(),
                "playready".to_string(),
                "fairplay".to_string(),
            ],
            license_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub extension: String,
    pub cleanup_temp: bool,
    pub merge_subtitles: bool,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            extension: "mp4".to_string(),
            cleanup_temp: true,
            merge_subtitles: true,
        }
    }
}

pub fn load_core_config<P: AsRef<Path>>(path: P) -> Result<CoreConfig> {
    let config: CoreConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
