mod pssh;
mod resolver;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use pssh::validate_pssh;
pub use resolver::{
    CdmKey, CdmKeyKind, CdmSession, ContentDecryptionModule, KeyResolver, LicenseEndpoint,
};

use crate::http::HttpError;

pub const WIDEVINE_UUID: &str = "edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";
pub const PLAYREADY_UUID: &str = "9a04f079-9840-4286-ab92-e65be0885f95";
pub const FAIRPLAY_UUID: &str = "94ce86fb-07ff-4f43-adb8-93d2fa968ca2";
pub const CENC_SCHEME: &str = "urn:mpeg:dash:mp4protection:2011";

#[derive(Debug, Error)]
pub enum DrmError {
    #[error("no CDM available for {0}")]
    NoCdm(DrmSystem),
    #[error("failed to build license challenge: {0}")]
    Challenge(String),
    #[error("license endpoint refused the request: http {status}")]
    LicenseRefused { status: u16 },
    #[error("license endpoint returned an empty body")]
    LicenseEmpty,
    #[error("failed to parse license: {0}")]
    LicenseParse(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("no content keys obtained from any PSSH")]
    NoKeys,
    #[error(transparent)]
    Http(#[from] HttpError),
}

pub type DrmResult<T> = Result<T, DrmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrmSystem {
    Widevine,
    Playready,
    Fairplay,
}

impl DrmSystem {
    pub const fn uuid(self) -> &'static str {
        match self {
            DrmSystem::Widevine => WIDEVINE_UUID,
            DrmSystem::Playready => PLAYREADY_UUID,
            DrmSystem::Fairplay => FAIRPLAY_UUID,
        }
    }

    /// Match a DASH `schemeIdUri` (typically `urn:uuid:<uuid>`) against the
    /// known protection systems.
    pub fn from_scheme_id(scheme_id: &str) -> Option<Self> {
        let lowered = scheme_id.to_ascii_lowercase();
        [DrmSystem::Widevine, DrmSystem::Playready, DrmSystem::Fairplay]
            .into_iter()
            .find(|system| lowered.contains(system.uuid()))
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "widevine" | "wv" => Some(DrmSystem::Widevine),
            "playready" | "pr" => Some(DrmSystem::Playready),
            "fairplay" | "fp" => Some(DrmSystem::Fairplay),
            _ => None,
        }
    }

    pub const fn default_license_content_type(self) -> &'static str {
        match self {
            DrmSystem::Widevine => "application/octet-stream",
            DrmSystem::Playready => "text/xml; charset=utf-8",
            DrmSystem::Fairplay => "application/octet-stream",
        }
    }
}

impl fmt::Display for DrmSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DrmSystem::Widevine => "widevine",
            DrmSystem::Playready => "playready",
            DrmSystem::Fairplay => "fairplay",
        };
        f.write_str(name)
    }
}

/// One protection-system payload lifted from a manifest, together with the
/// default_KID of the adaptation set it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsshRecord {
    pub system: DrmSystem,
    /// Base64 payload: a PSSH box for Widevine, a PRO for PlayReady.
    pub data: String,
    pub kid: Option<String>,
    /// Content kind the record was attached to: "video", "audio" or "global".
    pub track: String,
}

/// A KID:KEY pair of kind Content. Both halves are stored as lowercase hex
/// without dashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKey {
    pub kid: String,
    pub key: String,
}

impl ContentKey {
    /// Parse a `KID:KEY` string, normalizing case and stripping dashes.
    pub fn parse(raw: &str) -> DrmResult<Self> {
        let Some((kid, key)) = raw.split_once(':') else {
            return Err(DrmError::InvalidKey(format!(
                "expected KID:KEY, got {raw:?}"
            )));
        };
        let kid = normalize_hex(kid);
        let key = normalize_hex(key);
        if kid.len() != 32 || key.len() != 32 {
            return Err(DrmError::InvalidKey(format!(
                "KID and KEY must be 16 bytes each, got {}/{} hex chars",
                kid.len(),
                key.len()
            )));
        }
        if !kid.chars().all(|c| c.is_ascii_hexdigit())
            || !key.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(DrmError::InvalidKey("non-hex characters in key".into()));
        }
        Ok(Self { kid, key })
    }

    pub fn is_zero_kid(&self) -> bool {
        self.kid.chars().all(|c| c == '0')
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kid, self.key)
    }
}

fn normalize_hex(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_ascii_lowercase()
}
