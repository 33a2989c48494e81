use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::config::DrmSection;
use crate::http::HttpClient;

use super::{ContentKey, DrmError, DrmResult, DrmSystem, PsshRecord};

/// Where to send license challenges. Headers are the ones captured from
/// the original manifest fetch; query params are appended to the URL.
#[derive(Debug, Clone, Default)]
pub struct LicenseEndpoint {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query_params: Vec<(String, String)>,
}

impl LicenseEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            query_params: Vec::new(),
        }
    }

    fn request_url(&self) -> String {
        if self.query_params.is_empty() {
            return self.url.clone();
        }
        let query = self
            .query_params
            .iter()
            .map(|(name, value)| format!("{}={}", urlencode(name), urlencode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, query)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmKeyKind {
    Content,
    Signing,
    Other,
}

#[derive(Debug, Clone)]
pub struct CdmKey {
    pub kid: String,
    pub key: String,
    pub kind: CdmKeyKind,
}

/// One open CDM session. Implementations wrap a device-specific client
/// loaded from the caller's CDM blob; the license transport lives in
/// [`KeyResolver`], not here.
#[async_trait]
pub trait CdmSession: Send {
    async fn license_challenge(&mut self, pssh: &PsshRecord) -> DrmResult<Vec<u8>>;
    async fn parse_license(&mut self, license: &[u8]) -> DrmResult<()>;
    fn keys(&self) -> Vec<CdmKey>;
    async fn close(&mut self) -> DrmResult<()>;
}

#[async_trait]
pub trait ContentDecryptionModule: Send + Sync {
    fn system(&self) -> DrmSystem;
    async fn open_session(&self) -> DrmResult<Box<dyn CdmSession>>;
}

/// Drives the license exchange: per PSSH, open a session, POST the
/// challenge, feed the license back, and collect Content keys. A failing
/// PSSH is logged and skipped; the union of obtained keys is returned.
pub struct KeyResolver {
    http: HttpClient,
    preference: Vec<DrmSystem>,
    license_timeout: Duration,
}

impl KeyResolver {
    pub fn new(http: HttpClient, drm: &DrmSection) -> Self {
        let mut preference: Vec<DrmSystem> = drm
            .preference
            .iter()
            .filter_map(|name| DrmSystem::from_name(name))
            .collect();
        if preference.is_empty() {
            preference = vec![
                DrmSystem::Widevine,
                DrmSystem::Playready,
                DrmSystem::Fairplay,
            ];
        }
        Self {
            http,
            preference,
            license_timeout: Duration::from_secs(drm.license_timeout_s),
        }
    }

    /// A caller-supplied raw `KID:KEY` bypasses the whole protocol.
    pub fn resolve_raw(raw: &str) -> DrmResult<Vec<ContentKey>> {
        Ok(vec![ContentKey::parse(raw)?])
    }

    pub async fn resolve(
        &self,
        records: &[PsshRecord],
        endpoint: &LicenseEndpoint,
        cdms: &[Arc<dyn ContentDecryptionModule>],
    ) -> DrmResult<Vec<ContentKey>> {
        for system in &self.preference {
            let system_records: Vec<&PsshRecord> = records
                .iter()
                .filter(|record| record.system == *system)
                .collect();
            if system_records.is_empty() {
                continue;
            }
            let Some(cdm) = cdms.iter().find(|cdm| cdm.system() == *system) else {
                debug!(system = %system, "PSSH present but no CDM loaded, skipping");
                continue;
            };
            let keys = self
                .resolve_with_system(cdm.as_ref(), &system_records, endpoint)
                .await;
            if !keys.is_empty() {
                for key in &keys {
                    info!(kid = %key.kid, "content key obtained");
                }
                return Ok(keys);
            }
        }
        Err(DrmError::NoKeys)
    }

    async fn resolve_with_system(
        &self,
        cdm: &dyn ContentDecryptionModule,
        records: &[&PsshRecord],
        endpoint: &LicenseEndpoint,
    ) -> Vec<ContentKey> {
        let mut collected: Vec<ContentKey> = Vec::new();
        for record in records {
            let session = match cdm.open_session().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(system = %cdm.system(), error = %err, "failed to open CDM session");
                    continue;
                }
            };
            let mut session = session;
            let outcome = self.exchange(session.as_mut(), record, endpoint).await;
            if let Err(err) = session.close().await {
                warn!(system = %cdm.system(), error = %err, "failed to close CDM session");
            }
            match outcome {
                Ok(keys) => {
                    for key in keys {
                        if key.is_zero_kid() {
                            continue;
                        }
                        if !collected.contains(&key) {
                            collected.push(key);
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        system = %cdm.system(),
                        kid = record.kid.as_deref().unwrap_or("unknown"),
                        error = %err,
                        "license exchange failed for PSSH, continuing with the rest"
                    );
                }
            }
        }
        collected
    }

    async fn exchange(
        &self,
        session: &mut dyn CdmSession,
        record: &PsshRecord,
        endpoint: &LicenseEndpoint,
    ) -> DrmResult<Vec<ContentKey>> {
        let challenge = session.license_challenge(record).await?;

        let mut headers = endpoint.headers.clone();
        let has_content_type = headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            headers.insert(
                "Content-Type".to_string(),
                record.system.default_license_content_type().to_string(),
            );
        }

        let response = tokio::time::timeout(
            self.license_timeout,
            self.http.post(&endpoint.request_url(), &headers, challenge),
        )
        .await
        .map_err(|_| DrmError::LicenseRefused { status: 0 })??;

        if response.status != 200 {
            return Err(DrmError::LicenseRefused {
                status: response.status,
            });
        }
        let license = extract_license_bytes(
            response.content_type().unwrap_or_default(),
            &response.body,
        )?;
        if license.is_empty() {
            return Err(DrmError::LicenseEmpty);
        }
        session.parse_license(&license).await?;

        let mut keys = Vec::new();
        for key in session.keys() {
            if key.kind != CdmKeyKind::Content {
                continue;
            }
            keys.push(ContentKey::parse(&format!("{}:{}", key.kid, key.key))?);
        }
        Ok(keys)
    }
}

/// License bodies arrive either as raw bytes or as JSON carrying a base64
/// `license` field.
fn extract_license_bytes(content_type: &str, body: &[u8]) -> DrmResult<Vec<u8>> {
    let looks_json =
        content_type.contains("application/json") || body.first() == Some(&b'{');
    if !looks_json {
        return Ok(body.to_vec());
    }
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| DrmError::LicenseParse(err.to_string()))?;
    let Some(license_b64) = value.get("license").and_then(|v| v.as_str()) else {
        return Err(DrmError::LicenseParse(
            "'license' field not found in JSON response".into(),
        ));
    };
    BASE64
        .decode(license_b64)
        .map_err(|err| DrmError::LicenseParse(err.to_string()))
}

fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
