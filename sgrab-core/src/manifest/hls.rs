use std::collections::HashMap;

use url::Url;

use super::{
    split_variant_from_language, split_variant_from_name, EncryptionMethod, ManifestError,
    ManifestResult, Representation, SegmentContainer, SegmentEncryption, SegmentPlan, TrackKind,
    TrackVariant,
};

#[derive(Debug, Clone)]
pub struct MasterPlaylist {
    pub variants: Vec<VariantStream>,
    pub media: Vec<AlternateMedia>,
}

/// One `#EXT-X-STREAM-INF` entry.
#[derive(Debug, Clone)]
pub struct VariantStream {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
    pub audio_group: Option<String>,
    pub subtitles_group: Option<String>,
}

/// One `#EXT-X-MEDIA` entry (alternate audio or subtitles).
#[derive(Debug, Clone)]
pub struct AlternateMedia {
    pub kind: TrackKind,
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    pub uri: Option<String>,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HlsKey {
    pub method: EncryptionMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
}

#[derive(Debug, Clone)]
pub struct MediaSegment {
    pub uri: String,
    pub duration: f64,
}

#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub version: u32,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub init_url: Option<String>,
    pub key: Option<HlsKey>,
    pub segments: Vec<MediaSegment>,
    pub container: SegmentContainer,
    pub total_duration: f64,
}

pub fn is_master_playlist(text: &str) -> bool {
    text.lines()
        .any(|line| line.trim_start().starts_with("#EXT-X-STREAM-INF"))
}

pub fn parse_master_playlist(text: &str, base: &Url) -> ManifestResult<MasterPlaylist> {
    require_header(text)?;
    let mut variants = Vec::new();
    let mut media = Vec::new();
    let mut pending_inf: Option<HashMap<String, String>> = None;

    for line in text.lines().map(str::trim) {
        if let Some(tail) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_inf = Some(parse_attributes(tail));
        } else if let Some(tail) = line.strip_prefix("#EXT-X-MEDIA:") {
            let attrs = parse_attributes(tail);
            let kind = match attrs.get("TYPE").map(String::as_str) {
                Some("AUDIO") => TrackKind::Audio,
                Some("SUBTITLES") => TrackKind::Subtitle,
                _ => continue,
            };
            media.push(AlternateMedia {
                kind,
                group_id: attrs.get("GROUP-ID").cloned().unwrap_or_default(),
                name: attrs.get("NAME").cloned().unwrap_or_default(),
                language: attrs.get("LANGUAGE").cloned(),
                uri: attrs
                    .get("URI")
                    .map(|uri| resolve(base, uri))
                    .transpose()?,
                forced: attrs.get("FORCED").map(String::as_str) == Some("YES"),
            });
        } else if line.starts_with('#') || line.is_empty() {
            continue;
        } else if let Some(attrs) = pending_inf.take() {
            let resolution = attrs
                .get("RESOLUTION")
                .and_then(|value| parse_resolution(value));
            variants.push(VariantStream {
                uri: resolve(base, line)?,
                bandwidth: attrs
                    .get("BANDWIDTH")
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0),
                resolution,
                codecs: attrs.get("CODECS").cloned(),
                audio_group: attrs.get("AUDIO").cloned(),
                subtitles_group: attrs.get("SUBTITLES").cloned(),
            });
        }
    }

    if variants.is_empty() {
        return Err(ManifestError::invalid(
            "master playlist without #EXT-X-STREAM-INF entries",
        ));
    }
    Ok(MasterPlaylist { variants, media })
}

pub fn parse_media_playlist(text: &str, base: &Url) -> ManifestResult<MediaPlaylist> {
    require_header(text)?;
    let mut version = 3u32;
    let mut target_duration = 0.0f64;
    let mut media_sequence = 0u64;
    let mut init_url = None;
    let mut key: Option<HlsKey> = None;
    let mut segments = Vec::new();
    let mut pending_duration: Option<f64> = None;

    for line in text.lines().map(str::trim) {
        if let Some(tail) = line.strip_prefix("#EXT-X-VERSION:") {
            version = tail
                .parse()
                .map_err(|_| ManifestError::invalid("invalid EXT-X-VERSION"))?;
        } else if let Some(tail) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = tail
                .parse()
                .map_err(|_| ManifestError::invalid("invalid EXT-X-TARGETDURATION"))?;
        } else if let Some(tail) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = tail
                .parse()
                .map_err(|_| ManifestError::invalid("invalid EXT-X-MEDIA-SEQUENCE"))?;
        } else if let Some(tail) = line.strip_prefix("#EXT-X-KEY:") {
            // The first keyed section governs the whole track; a later
            // METHOD=NONE clears it only for subsequent segments, which
            // does not occur in VOD playlists this engine targets.
            let parsed = parse_key(&parse_attributes(tail), base)?;
            if key.is_none() {
                key = parsed;
            }
        } else if let Some(tail) = line.strip_prefix("#EXT-X-MAP:") {
            let attrs = parse_attributes(tail);
            if let Some(uri) = attrs.get("URI") {
                init_url = Some(resolve(base, uri)?);
            }
        } else if let Some(tail) = line.strip_prefix("#EXTINF:") {
            let duration_field = tail.split(',').next().unwrap_or(tail);
            pending_duration = Some(
                duration_field
                    .trim()
                    .parse()
                    .map_err(|_| ManifestError::invalid("invalid EXTINF duration"))?,
            );
        } else if line.starts_with('#') || line.is_empty() {
            continue;
        } else if let Some(duration) = pending_duration.take() {
            segments.push(MediaSegment {
                uri: resolve(base, line)?,
                duration,
            });
        }
    }

    if segments.is_empty() {
        return Err(ManifestError::invalid("media playlist without segments"));
    }
    let container = detect_container(&segments);
    let total_duration = segments.iter().map(|segment| segment.duration).sum();
    Ok(MediaPlaylist {
        version,
        target_duration,
        media_sequence,
        init_url,
        key,
        segments,
        container,
        total_duration,
    })
}

fn require_header(text: &str) -> ManifestResult<()> {
    if !text.trim_start().starts_with("#EXTM3U") {
        return Err(ManifestError::invalid("missing #EXTM3U header"));
    }
    Ok(())
}

fn parse_key(attrs: &HashMap<String, String>, base: &Url) -> ManifestResult<Option<HlsKey>> {
    let method = match attrs.get("METHOD").map(String::as_str) {
        None | Some("NONE") => return Ok(None),
        Some("AES-128") => EncryptionMethod::Aes128,
        Some("SAMPLE-AES") => {
            // SAMPLE-AES with a non-identity key format is DRM-keyed.
            match attrs.get("KEYFORMAT") {
                Some(format) if format != "identity" => EncryptionMethod::Cenc,
                _ => EncryptionMethod::SampleAes,
            }
        }
        Some("SAMPLE-AES-CTR") => EncryptionMethod::Cenc,
        Some(other) => {
            return Err(ManifestError::invalid(format!(
                "unsupported key method {other}"
            )))
        }
    };
    let uri = attrs
        .get("URI")
        .map(|uri| resolve(base, uri))
        .transpose()?;
    let iv = attrs.get("IV").map(|iv| parse_iv(iv)).transpose()?;
    Ok(Some(HlsKey { method, uri, iv }))
}

fn parse_iv(value: &str) -> ManifestResult<[u8; 16]> {
    let stripped = value
        .trim()
        .strip_prefix("0x")
        .or_else(|| value.trim().strip_prefix("0X"))
        .unwrap_or(value.trim());
    let bytes =
        hex::decode(stripped).map_err(|_| ManifestError::invalid("invalid IV attribute"))?;
    bytes
        .try_into()
        .map_err(|_| ManifestError::invalid("IV must be 16 bytes"))
}

/// Container from the majority of segment extensions.
fn detect_container(segments: &[MediaSegment]) -> SegmentContainer {
    let mut counts: HashMap<SegmentContainer, usize> = HashMap::new();
    for segment in segments {
        let path = segment.uri.split(['?', '#']).next().unwrap_or(&segment.uri);
        let container = match path.rsplit('.').next().map(str::to_ascii_lowercase) {
            Some(ext) if ext == "ts" => SegmentContainer::Ts,
            Some(ext) if ext == "mp4" => SegmentContainer::Mp4,
            Some(ext) if ext == "m4s" => SegmentContainer::M4s,
            Some(ext) if ext == "aac" => SegmentContainer::Aac,
            _ => continue,
        };
        *counts.entry(container).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(container, _)| container)
        .unwrap_or(SegmentContainer::Ts)
}

fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

fn resolve(base: &Url, uri: &str) -> ManifestResult<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") || uri.starts_with("file://") {
        return Ok(uri.to_string());
    }
    base.join(uri)
        .map(|joined| joined.to_string())
        .map_err(|err| ManifestError::invalid(format!("cannot resolve uri {uri}: {err}")))
}

/// Attribute lists are comma separated with optionally quoted values that
/// may themselves contain commas (CODECS="avc1.64,mp4a.40").
fn parse_attributes(tail: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = tail.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let name = rest[..eq].trim().to_string();
        let after = &rest[eq + 1..];
        let (value, remainder) = if let Some(stripped) = after.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => (
                    stripped[..end].to_string(),
                    stripped[end + 1..].trim_start_matches(','),
                ),
                None => (stripped.to_string(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].to_string(), &after[end + 1..]),
                None => (after.to_string(), ""),
            }
        };
        attrs.insert(name, value);
        rest = remainder.trim();
    }
    attrs
}

pub(super) fn variant_to_representation(
    index: usize,
    variant: &VariantStream,
    media: &MediaPlaylist,
) -> Representation {
    media_playlist_to_representation(
        &format!("video-{index}"),
        TrackKind::Video,
        None,
        None,
        variant.bandwidth,
        variant.resolution,
        media,
    )
    .with_codec(variant.codecs.clone())
}

pub(super) fn rendition_to_representation(
    index: usize,
    rendition: &AlternateMedia,
    media: &MediaPlaylist,
) -> Representation {
    let prefix = match rendition.kind {
        TrackKind::Audio => "audio",
        TrackKind::Subtitle => "sub",
        TrackKind::Video => "video",
    };
    let (language, variant_from_code) = match rendition.language.as_deref() {
        Some(code) => {
            let (base, variant) = split_variant_from_language(code);
            (Some(base), variant)
        }
        None => (None, TrackVariant::None),
    };
    let (clean_name, variant_from_name) = split_variant_from_name(&rendition.name);
    let mut variant = if variant_from_code.is_special() {
        variant_from_code
    } else {
        variant_from_name
    };
    if rendition.forced {
        variant = TrackVariant::Forced;
    }

    let mut representation = media_playlist_to_representation(
        &format!("{prefix}-{index}"),
        rendition.kind,
        language,
        Some(clean_name),
        0,
        None,
        media,
    );
    representation.variant = variant;
    representation
}

#[allow(clippy::too_many_arguments)]
pub(super) fn media_playlist_to_representation(
    id: &str,
    kind: TrackKind,
    language: Option<String>,
    language_long: Option<String>,
    bandwidth: u64,
    resolution: Option<(u32, u32)>,
    media: &MediaPlaylist,
) -> Representation {
    let encryption = media.key.as_ref().map(|key| SegmentEncryption {
        method: key.method,
        key_uri: key.uri.clone(),
        iv: key.iv,
        media_sequence: media.media_sequence,
    });
    let encrypted = encryption.is_some();
    Representation {
        id: id.to_string(),
        kind,
        codec: "unknown".to_string(),
        bandwidth,
        resolution,
        language,
        language_long,
        variant: TrackVariant::None,
        segments: SegmentPlan::Segments {
            init_url: media.init_url.clone(),
            urls: media
                .segments
                .iter()
                .map(|segment| segment.uri.clone())
                .collect(),
            container: media.container,
            encryption,
        },
        encrypted,
        default_kid: None,
        pssh: Vec::new(),
        duration_s: media.total_duration,
    }
}

impl Representation {
    fn with_codec(mut self, codec: Option<String>) -> Self {
        if let Some(codec) = codec {
            self.codec = codec;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://cdn.example/stream/play.m3u8").unwrap()
    }

    const MASTER: &str = r#"#EXTM3U
#EXT-X-VERSION:6
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aud",NAME="Italiano",LANGUAGE="it",URI="audio_it/index.m3u8"
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID="subs",NAME="English [Forced]",LANGUAGE="en",FORCED=YES,URI="subs_en/index.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=4500000,RESOLUTION=1920x1080,CODECS="avc1.640028,mp4a.40.2",AUDIO="aud"
hd/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1400000,RESOLUTION=1280x720,AUDIO="aud"
sd/index.m3u8
"#;

    const MEDIA: &str = r#"#EXTM3U
#EXT-X-VERSION:6
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:12
#EXT-X-MAP:URI="init.mp4"
#EXT-X-KEY:METHOD=AES-128,URI="key.bin",IV=0x000102030405060708090A0B0C0D0E0F
#EXTINF:4.004,
seg_000.m4s
#EXTINF:4.004,
seg_001.m4s
#EXTINF:2.002,
seg_002.m4s
#EXT-X-ENDLIST
"#;

    #[test]
    fn master_playlist_parses_variants_and_media() {
        let master = parse_master_playlist(MASTER, &base()).unwrap();
        assert_eq!(master.variants.len(), 2);
        assert_eq!(master.variants[0].bandwidth, 4_500_000);
        assert_eq!(master.variants[0].resolution, Some((1920, 1080)));
        assert_eq!(
            master.variants[0].uri,
            "https://cdn.example/stream/hd/index.m3u8"
        );
        assert_eq!(
            master.variants[0].codecs.as_deref(),
            Some("avc1.640028,mp4a.40.2")
        );
        assert_eq!(master.media.len(), 2);
        assert_eq!(master.media[0].language.as_deref(), Some("it"));
        assert!(master.media[1].forced);
    }

    #[test]
    fn media_playlist_parses_key_map_and_segments() {
        let media = parse_media_playlist(MEDIA, &base()).unwrap();
        assert_eq!(media.media_sequence, 12);
        assert_eq!(
            media.init_url.as_deref(),
            Some("https://cdn.example/stream/init.mp4")
        );
        let key = media.key.as_ref().unwrap();
        assert_eq!(key.method, EncryptionMethod::Aes128);
        assert_eq!(key.uri.as_deref(), Some("https://cdn.example/stream/key.bin"));
        assert_eq!(
            key.iv,
            Some([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15])
        );
        assert_eq!(media.segments.len(), 3);
        assert_eq!(media.container, SegmentContainer::M4s);
        assert!((media.total_duration - 10.01).abs() < 1e-9);
    }

    #[test]
    fn absolute_uris_are_kept() {
        let playlist = "#EXTM3U\n#EXTINF:4,\nhttps://other.example/a.ts\n";
        let media = parse_media_playlist(playlist, &base()).unwrap();
        assert_eq!(media.segments[0].uri, "https://other.example/a.ts");
        assert_eq!(media.container, SegmentContainer::Ts);
    }

    #[test]
    fn missing_header_is_invalid() {
        assert!(parse_media_playlist("not a playlist", &base()).is_err());
        assert!(parse_master_playlist("#EXTM3U\n", &base()).is_err());
    }

    #[test]
    fn sample_aes_with_keyformat_is_drm() {
        let playlist = "#EXTM3U\n#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://key\",KEYFORMAT=\"com.apple.streamingkeydelivery\"\n#EXTINF:4,\nseg.m4s\n";
        let media = parse_media_playlist(playlist, &base()).unwrap();
        assert_eq!(media.key.as_ref().unwrap().method, EncryptionMethod::Cenc);
    }

    #[test]
    fn attribute_parser_handles_quoted_commas() {
        let attrs = parse_attributes("BANDWIDTH=100,CODECS=\"a,b\",NAME=\"x\"");
        assert_eq!(attrs.get("BANDWIDTH").map(String::as_str), Some("100"));
        assert_eq!(attrs.get("CODECS").map(String::as_str), Some("a,b"));
        assert_eq!(attrs.get("NAME").map(String::as_str), Some("x"));
    }
}
