mod hls;
mod mpd;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub use hls::{parse_master_playlist, parse_media_playlist, HlsKey, MasterPlaylist, MediaPlaylist};
pub use mpd::parse_mpd;

use crate::drm::PsshRecord;
use crate::http::{HttpClient, HttpError};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest: {reason}")]
    Invalid { reason: String },
    #[error("manifest fetch failed with http {status} for {url}")]
    FetchStatus { status: u16, url: String },
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl ManifestError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ManifestError::Invalid {
            reason: reason.into(),
        }
    }
}

pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    Hls,
    Dash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

/// Subtitle/audio rendition flavor, recognized from name suffixes
/// (`[Forced]`, `(SDH)`) or language-code prefixes (`forced-it`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackVariant {
    #[default]
    None,
    Forced,
    Sdh,
    Cc,
    Other(String),
}

impl TrackVariant {
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "" => TrackVariant::None,
            "forced" => TrackVariant::Forced,
            "sdh" => TrackVariant::Sdh,
            "cc" => TrackVariant::Cc,
            other => TrackVariant::Other(other.to_string()),
        }
    }

    pub fn is_special(&self) -> bool {
        !matches!(self, TrackVariant::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentContainer {
    Ts,
    Mp4,
    M4s,
    Aac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMethod {
    Aes128,
    SampleAes,
    Cenc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentEncryption {
    pub method: EncryptionMethod,
    pub key_uri: Option<String>,
    /// Explicit IV from the playlist. When absent the fetcher derives the
    /// IV from the media sequence number.
    pub iv: Option<[u8; 16]>,
    pub media_sequence: u64,
}

impl SegmentEncryption {
    /// AES-128/SAMPLE-AES are handled inline by the fetcher; CENC needs
    /// DRM keys and an external decrypt step.
    pub fn needs_drm(&self) -> bool {
        matches!(self.method, EncryptionMethod::Cenc)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "plan")]
pub enum SegmentPlan {
    /// DASH on-demand single-file MP4: one URL, byte-based progress.
    SingleFile { url: String },
    /// Segmented track: optional init segment plus an ordered URL list.
    Segments {
        init_url: Option<String>,
        urls: Vec<String>,
        container: SegmentContainer,
        encryption: Option<SegmentEncryption>,
    },
}

impl SegmentPlan {
    pub fn segment_count(&self) -> usize {
        match self {
            SegmentPlan::SingleFile { .. } => 0,
            SegmentPlan::Segments { urls, .. } => urls.len(),
        }
    }

    pub fn encryption(&self) -> Option<&SegmentEncryption> {
        match self {
            SegmentPlan::SingleFile { .. } => None,
            SegmentPlan::Segments { encryption, .. } => encryption.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub id: String,
    pub kind: TrackKind,
    pub codec: String,
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub language: Option<String>,
    pub language_long: Option<String>,
    #[serde(default)]
    pub variant: TrackVariant,
    pub segments: SegmentPlan,
    pub encrypted: bool,
    pub default_kid: Option<String>,
    #[serde(default)]
    pub pssh: Vec<PsshRecord>,
    pub duration_s: f64,
}

impl Representation {
    pub fn height(&self) -> Option<u32> {
        self.resolution.map(|(_, h)| h)
    }

    pub fn needs_drm(&self) -> bool {
        self.encrypted
            && self
                .segments
                .encryption()
                .map(SegmentEncryption::needs_drm)
                .unwrap_or(true)
    }

    /// Case-insensitive match against short code and long name.
    pub fn matches_language(&self, tag: &str) -> bool {
        let tag = tag.to_ascii_lowercase();
        self.language
            .as_deref()
            .map(|lang| lang.to_ascii_lowercase() == tag)
            .unwrap_or(false)
            || self
                .language_long
                .as_deref()
                .map(|name| name.to_ascii_lowercase() == tag)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSet {
    pub kind: ManifestKind,
    pub representations: Vec<Representation>,
}

impl StreamSet {
    /// A manifest without a single video representation is rejected.
    pub fn validate(&self) -> ManifestResult<()> {
        if !self
            .representations
            .iter()
            .any(|rep| rep.kind == TrackKind::Video)
        {
            return Err(ManifestError::invalid("no video representation found"));
        }
        Ok(())
    }

    pub fn of_kind(&self, kind: TrackKind) -> impl Iterator<Item = &Representation> {
        self.representations
            .iter()
            .filter(move |rep| rep.kind == kind)
    }

    pub fn is_encrypted(&self) -> bool {
        self.representations.iter().any(|rep| rep.encrypted)
    }

    pub fn pssh_records(&self) -> Vec<PsshRecord> {
        let mut records = Vec::new();
        for rep in &self.representations {
            for record in &rep.pssh {
                if !records.contains(record) {
                    records.push(record.clone());
                }
            }
        }
        records
    }

    pub fn to_json(&self) -> ManifestResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| ManifestError::invalid(format!("serialize: {err}")))
    }

    pub fn from_json(text: &str) -> ManifestResult<Self> {
        serde_json::from_str(text)
            .map_err(|err| ManifestError::invalid(format!("deserialize: {err}")))
    }
}

/// Raw manifest text plus the parsed stream set; the orchestrator
/// persists the raw side as `raw.m3u8` / `raw.mpd`.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub stream_set: StreamSet,
    pub raw: String,
    pub url: String,
}

/// Fetches a manifest URL, detects HLS vs MPD, resolves variant playlists
/// and produces a validated [`StreamSet`].
pub struct ManifestLoader {
    http: HttpClient,
}

impl ManifestLoader {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub async fn load(
        &self,
        manifest_url: &str,
        headers: &HashMap<String, String>,
    ) -> ManifestResult<LoadedManifest> {
        let base = Url::parse(manifest_url)
            .map_err(|err| ManifestError::invalid(format!("manifest url: {err}")))?;
        let response = self.http.get(manifest_url, headers).await?;
        if !response.is_success() {
            return Err(ManifestError::FetchStatus {
                status: response.status,
                url: manifest_url.to_string(),
            });
        }
        let text = response.text();
        let stream_set = self.parse(&text, &base, headers).await?;
        stream_set.validate()?;
        Ok(LoadedManifest {
            stream_set,
            raw: text,
            url: manifest_url.to_string(),
        })
    }

    /// Parse pre-extracted manifest text against a caller-supplied base
    /// URL instead of fetching from the origin.
    pub async fn load_from_text(
        &self,
        text: &str,
        base_url: &str,
        headers: &HashMap<String, String>,
    ) -> ManifestResult<LoadedManifest> {
        let base = Url::parse(base_url)
            .map_err(|err| ManifestError::invalid(format!("base url: {err}")))?;
        let stream_set = self.parse(text, &base, headers).await?;
        stream_set.validate()?;
        Ok(LoadedManifest {
            stream_set,
            raw: text.to_string(),
            url: base_url.to_string(),
        })
    }

    async fn parse(
        &self,
        text: &str,
        base: &Url,
        headers: &HashMap<String, String>,
    ) -> ManifestResult<StreamSet> {
        let trimmed = text.trim_start();
        if trimmed.starts_with("#EXTM3U") {
            return self.parse_hls(text, base, headers).await;
        }
        if trimmed.starts_with('<') && text.contains("<MPD") {
            let representations = parse_mpd(text, base)?;
            return Ok(StreamSet {
                kind: ManifestKind::Dash,
                representations: dedupe_subtitles(representations),
            });
        }
        Err(ManifestError::invalid(
            "neither an M3U8 playlist nor an MPD document",
        ))
    }

    async fn parse_hls(
        &self,
        text: &str,
        base: &Url,
        headers: &HashMap<String, String>,
    ) -> ManifestResult<StreamSet> {
        if !hls::is_master_playlist(text) {
            // A bare media playlist carries exactly one video track.
            let media = parse_media_playlist(text, base)?;
            let representation = hls::media_playlist_to_representation(
                "video-0",
                TrackKind::Video,
                None,
                None,
                0,
                None,
                &media,
            );
            return Ok(StreamSet {
                kind: ManifestKind::Hls,
                representations: vec![representation],
            });
        }

        let master = parse_master_playlist(text, base)?;
        let mut representations = Vec::new();

        for (index, variant) in master.variants.iter().enumerate() {
            let media = self.fetch_media_playlist(&variant.uri, headers).await?;
            representations.push(hls::variant_to_representation(index, variant, &media));
        }

        for (index, rendition) in master.media.iter().enumerate() {
            let Some(uri) = rendition.uri.as_deref() else {
                debug!(name = %rendition.name, "skipping rendition without URI");
                continue;
            };
            let media = match self.fetch_media_playlist(uri, headers).await {
                Ok(media) => media,
                Err(err) => {
                    warn!(name = %rendition.name, error = %err, "failed to load rendition playlist");
                    continue;
                }
            };
            representations.push(hls::rendition_to_representation(index, rendition, &media));
        }

        Ok(StreamSet {
            kind: ManifestKind::Hls,
            representations: dedupe_subtitles(representations),
        })
    }

    async fn fetch_media_playlist(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> ManifestResult<MediaPlaylist> {
        let response = self.http.get(url, headers).await?;
        if !response.is_success() {
            return Err(ManifestError::FetchStatus {
                status: response.status,
                url: url.to_string(),
            });
        }
        let base = Url::parse(url)
            .map_err(|err| ManifestError::invalid(format!("playlist url: {err}")))?;
        parse_media_playlist(&response.text(), &base)
    }
}

/// Split `Name [Forced]` / `Name (SDH)` style labels into a clean name
/// and a variant.
pub fn split_variant_from_name(name: &str) -> (String, TrackVariant) {
    let trimmed = name.trim();
    for (open, close) in [('[', ']'), ('(', ')')] {
        if trimmed.ends_with(close) {
            if let Some(start) = trimmed.rfind(open) {
                let base = trimmed[..start].trim().to_string();
                let label = trimmed[start + 1..trimmed.len() - 1].trim();
                if !base.is_empty() && !label.is_empty() {
                    return (base, TrackVariant::from_label(label));
                }
            }
        }
    }
    (trimmed.to_string(), TrackVariant::None)
}

/// Split `forced-it` / `it-sdh` style language codes into a base code and
/// a variant.
pub fn split_variant_from_language(code: &str) -> (String, TrackVariant) {
    let lowered = code.to_ascii_lowercase();
    for prefix in ["forced-", "sdh-", "cc-"] {
        if let Some(rest) = lowered.strip_prefix(prefix) {
            return (
                rest.to_string(),
                TrackVariant::from_label(prefix.trim_end_matches('-')),
            );
        }
    }
    for suffix in ["-forced", "-sdh", "-cc"] {
        if let Some(rest) = lowered.strip_suffix(suffix) {
            return (
                rest.to_string(),
                TrackVariant::from_label(suffix.trim_start_matches('-')),
            );
        }
    }
    (lowered, TrackVariant::None)
}

/// Identical (language, name, variant) subtitle entries show up more than
/// once in some manifests; keep the first of each.
fn dedupe_subtitles(representations: Vec<Representation>) -> Vec<Representation> {
    let mut seen: Vec<(String, String, TrackVariant)> = Vec::new();
    representations
        .into_iter()
        .filter(|rep| {
            if rep.kind != TrackKind::Subtitle {
                return true;
            }
            let key = (
                rep.language.clone().unwrap_or_default().to_ascii_lowercase(),
                rep.language_long
                    .clone()
                    .unwrap_or_default()
                    .to_ascii_lowercase(),
                rep.variant.clone(),
            );
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        })
        .collect()
}
