use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::drm::{validate_pssh, DrmSystem, PsshRecord, CENC_SCHEME};

use super::{
    split_variant_from_language, EncryptionMethod, ManifestError, ManifestResult, Representation,
    SegmentContainer, SegmentEncryption, SegmentPlan, TrackKind, TrackVariant,
};

// serde ignores unknown fields, so the structs below only model the parts
// of the MPD schema this engine consumes. Namespaced names are matched
// both with and without their conventional prefix.

#[derive(Debug, Deserialize)]
struct Mpd {
    #[serde(rename = "@mediaPresentationDuration")]
    media_presentation_duration: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<XmlBaseUrl>,
    #[serde(rename = "Period", default)]
    periods: Vec<XmlPeriod>,
}

#[derive(Debug, Deserialize)]
struct XmlPeriod {
    #[serde(rename = "@duration")]
    duration: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<XmlBaseUrl>,
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<XmlAdaptationSet>,
}

#[derive(Debug, Deserialize)]
struct XmlAdaptationSet {
    #[serde(rename = "@contentType")]
    content_type: Option<String>,
    #[serde(rename = "@mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "@lang")]
    lang: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<XmlBaseUrl>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<XmlSegmentTemplate>,
    #[serde(rename = "ContentProtection", default)]
    content_protection: Vec<XmlContentProtection>,
    #[serde(rename = "Representation", default)]
    representations: Vec<XmlRepresentation>,
}

#[derive(Debug, Deserialize)]
struct XmlRepresentation {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@bandwidth")]
    bandwidth: Option<u64>,
    #[serde(rename = "@codecs")]
    codecs: Option<String>,
    #[serde(rename = "@width")]
    width: Option<u32>,
    #[serde(rename = "@height")]
    height: Option<u32>,
    #[serde(rename = "@mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "BaseURL")]
    base_url: Option<XmlBaseUrl>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<XmlSegmentTemplate>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<XmlSegmentList>,
    #[serde(rename = "ContentProtection", default)]
    content_protection: Vec<XmlContentProtection>,
}

#[derive(Debug, Deserialize)]
struct XmlBaseUrl {
    #[serde(rename = "$text")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlSegmentTemplate {
    #[serde(rename = "@initialization")]
    initialization: Option<String>,
    #[serde(rename = "@media")]
    media: Option<String>,
    #[serde(rename = "@startNumber")]
    start_number: Option<u64>,
    #[serde(rename = "@duration")]
    duration: Option<f64>,
    #[serde(rename = "@timescale")]
    timescale: Option<u64>,
    #[serde(rename = "SegmentTimeline")]
    timeline: Option<XmlSegmentTimeline>,
}

#[derive(Debug, Deserialize)]
struct XmlSegmentTimeline {
    #[serde(rename = "S", default)]
    entries: Vec<XmlS>,
}

#[derive(Debug, Deserialize)]
struct XmlS {
    #[serde(rename = "@t")]
    t: Option<u64>,
    #[serde(rename = "@d")]
    d: u64,
    #[serde(rename = "@r")]
    r: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct XmlSegmentList {
    #[serde(rename = "Initialization")]
    initialization: Option<XmlInitialization>,
    #[serde(rename = "SegmentURL", default)]
    segment_urls: Vec<XmlSegmentUrl>,
}

#[derive(Debug, Deserialize)]
struct XmlInitialization {
    #[serde(rename = "@sourceURL")]
    source_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlSegmentUrl {
    #[serde(rename = "@media")]
    media: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlContentProtection {
    #[serde(rename = "@schemeIdUri")]
    scheme_id_uri: Option<String>,
    #[serde(rename = "@cenc:default_KID", alias = "@default_KID")]
    default_kid: Option<String>,
    #[serde(rename = "cenc:pssh", alias = "pssh")]
    pssh: Option<XmlText>,
    #[serde(rename = "mspr:pro", alias = "pro")]
    pro: Option<XmlText>,
}

#[derive(Debug, Deserialize)]
struct XmlText {
    #[serde(rename = "$text")]
    value: Option<String>,
}

pub fn parse_mpd(text: &str, manifest_url: &Url) -> ManifestResult<Vec<Representation>> {
    let mpd: Mpd = quick_xml::de::from_str(text)
        .map_err(|err| ManifestError::invalid(format!("mpd xml: {err}")))?;

    let mpd_duration = mpd
        .media_presentation_duration
        .as_deref()
        .and_then(parse_xs_duration);
    let mpd_base = join_base(manifest_url.clone(), mpd.base_url.as_ref())?;

    let mut representations = Vec::new();
    let mut counters = [0usize; 3];

    for period in &mpd.periods {
        let period_duration = period
            .duration
            .as_deref()
            .and_then(parse_xs_duration)
            .or(mpd_duration);
        let period_base = join_base(mpd_base.clone(), period.base_url.as_ref())?;

        for adaptation in &period.adaptation_sets {
            let Some(kind) = track_kind(adaptation) else {
                debug!(
                    content_type = adaptation.content_type.as_deref().unwrap_or("unknown"),
                    "skipping adaptation set of unsupported content type"
                );
                continue;
            };
            let adapt_base = join_base(period_base.clone(), adaptation.base_url.as_ref())?;
            let default_kid = extract_default_kid(&adaptation.content_protection);

            for representation in &adaptation.representations {
                // Representation-level BaseURL is the media URL itself on
                // the single-file path, so it is not part of the base
                // chain here.
                let rep_base = adapt_base.clone();

                let counter = &mut counters[kind_index(kind)];
                let fallback_id = format!("{}-{}", kind_prefix(kind), counter);
                *counter += 1;
                let id = representation.id.clone().unwrap_or(fallback_id);

                let mut pssh = extract_pssh_records(
                    &adaptation.content_protection,
                    kind,
                    default_kid.as_deref(),
                );
                for record in extract_pssh_records(
                    &representation.content_protection,
                    kind,
                    default_kid.as_deref(),
                ) {
                    if !pssh.contains(&record) {
                        pssh.push(record);
                    }
                }
                let encrypted = is_protected(&adaptation.content_protection)
                    || is_protected(&representation.content_protection);

                let template = representation
                    .segment_template
                    .as_ref()
                    .or(adaptation.segment_template.as_ref());

                let (plan, plan_duration) = build_segment_plan(
                    representation,
                    template,
                    &rep_base,
                    &id,
                    period_duration,
                    encrypted,
                )?;

                let (language, variant) = match adaptation.lang.as_deref() {
                    Some(code) => {
                        let (base, variant) = split_variant_from_language(code);
                        (Some(base), variant)
                    }
                    None => (None, TrackVariant::None),
                };

                representations.push(Representation {
                    id,
                    kind,
                    codec: representation
                        .codecs
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    bandwidth: representation.bandwidth.unwrap_or(0),
                    resolution: match (representation.width, representation.height) {
                        (Some(w), Some(h)) => Some((w, h)),
                        _ => None,
                    },
                    language,
                    language_long: None,
                    variant,
                    segments: plan,
                    encrypted,
                    default_kid: default_kid.clone(),
                    pssh,
                    duration_s: plan_duration.or(period_duration).unwrap_or(0.0),
                });
            }
        }
    }

    if representations.is_empty() {
        return Err(ManifestError::invalid(
            "MPD contains no usable representations",
        ));
    }
    Ok(representations)
}

fn build_segment_plan(
    representation: &XmlRepresentation,
    template: Option<&XmlSegmentTemplate>,
    base: &Url,
    rep_id: &str,
    period_duration: Option<f64>,
    encrypted: bool,
) -> ManifestResult<(SegmentPlan, Option<f64>)> {
    let encryption = encrypted.then_some(SegmentEncryption {
        method: EncryptionMethod::Cenc,
        key_uri: None,
        iv: None,
        media_sequence: 0,
    });
    let bandwidth = representation.bandwidth.unwrap_or(0);

    if let Some(template) = template {
        if let Some(media) = template.media.as_deref() {
            let (urls, duration) =
                expand_template(template, media, rep_id, bandwidth, base, period_duration)?;
            let init_url = template
                .initialization
                .as_deref()
                .map(|init| {
                    resolve(
                        base,
                        &substitute(init, rep_id, bandwidth, None, None),
                    )
                })
                .transpose()?;
            let container = container_from_path(media);
            return Ok((
                SegmentPlan::Segments {
                    init_url,
                    urls,
                    container,
                    encryption,
                },
                duration,
            ));
        }
    }

    if let Some(list) = representation.segment_list.as_ref() {
        let init_url = list
            .initialization
            .as_ref()
            .and_then(|init| init.source_url.as_deref())
            .map(|uri| resolve(base, uri))
            .transpose()?;
        let mut urls = Vec::new();
        for entry in &list.segment_urls {
            if let Some(media) = entry.media.as_deref() {
                urls.push(resolve(base, media)?);
            }
        }
        if urls.is_empty() {
            return Err(ManifestError::invalid("SegmentList without SegmentURL"));
        }
        let container = container_from_path(&urls[0]);
        return Ok((
            SegmentPlan::Segments {
                init_url,
                urls,
                container,
                encryption,
            },
            None,
        ));
    }

    if let Some(base_url) = representation.base_url.as_ref() {
        let value = base_url
            .value
            .as_deref()
            .ok_or_else(|| ManifestError::invalid("empty BaseURL"))?;
        return Ok((
            SegmentPlan::SingleFile {
                url: resolve(base, value)?,
            },
            None,
        ));
    }

    Err(ManifestError::invalid(format!(
        "representation {rep_id} has no SegmentTemplate, SegmentList or BaseURL"
    )))
}

/// Expand a `SegmentTemplate` into the ordered URL list, either from a
/// `SegmentTimeline` or from a fixed segment duration.
fn expand_template(
    template: &XmlSegmentTemplate,
    media: &str,
    rep_id: &str,
    bandwidth: u64,
    base: &Url,
    period_duration: Option<f64>,
) -> ManifestResult<(Vec<String>, Option<f64>)> {
    let timescale = template.timescale.unwrap_or(1).max(1);
    let start_number = template.start_number.unwrap_or(1);
    let mut urls = Vec::new();

    if let Some(timeline) = template.timeline.as_ref() {
        let mut number = start_number;
        let mut current_time: u64 = 0;
        let mut total_ticks: u64 = 0;
        for entry in &timeline.entries {
            if let Some(t) = entry.t {
                current_time = t;
            }
            let repeats = match entry.r.unwrap_or(0) {
                r if r >= 0 => r as u64,
                // r = -1 repeats until the period ends.
                _ => match period_duration {
                    Some(duration) => {
                        let end_ticks = (duration * timescale as f64) as u64;
                        let remaining = end_ticks.saturating_sub(current_time);
                        (remaining / entry.d.max(1)).saturating_sub(1)
                    }
                    None => 0,
                },
            };
            for _ in 0..=repeats {
                urls.push(resolve(
                    base,
                    &substitute(media, rep_id, bandwidth, Some(number), Some(current_time)),
                )?);
                current_time += entry.d;
                total_ticks += entry.d;
                number += 1;
            }
        }
        if urls.is_empty() {
            return Err(ManifestError::invalid("empty SegmentTimeline"));
        }
        let duration = total_ticks as f64 / timescale as f64;
        return Ok((urls, Some(duration)));
    }

    let segment_duration = template
        .duration
        .ok_or_else(|| ManifestError::invalid("SegmentTemplate without duration or timeline"))?
        / timescale as f64;
    let total = period_duration.ok_or_else(|| {
        ManifestError::invalid("cannot expand $Number$ template without a known duration")
    })?;
    let count = (total / segment_duration).ceil().max(1.0) as u64;
    for number in start_number..start_number + count {
        urls.push(resolve(
            base,
            &substitute(media, rep_id, bandwidth, Some(number), None),
        )?);
    }
    Ok((urls, Some(total)))
}

/// `$RepresentationID$` / `$Bandwidth$` / `$Number$` / `$Time$`
/// substitution, including `$Number%05d$` width formatting.
fn substitute(
    template: &str,
    rep_id: &str,
    bandwidth: u64,
    number: Option<u64>,
    time: Option<u64>,
) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('$') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('$') else {
            output.push('$');
            rest = after;
            continue;
        };
        let token = &after[..end];
        let (name, width) = match token.split_once('%') {
            Some((name, format)) => (name, parse_format_width(format)),
            None => (token, None),
        };
        let value = match name {
            "RepresentationID" => Some(rep_id.to_string()),
            "Bandwidth" => Some(bandwidth.to_string()),
            "Number" => number.map(|n| format_number(n, width)),
            "Time" => time.map(|t| format_number(t, width)),
            "" => Some("$".to_string()),
            _ => None,
        };
        match value {
            Some(value) => output.push_str(&value),
            // Unknown token: keep it verbatim.
            None => {
                output.push('$');
                output.push_str(token);
                output.push('$');
            }
        }
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    output
}

fn parse_format_width(format: &str) -> Option<usize> {
    format
        .strip_prefix('0')
        .and_then(|rest| rest.strip_suffix('d'))
        .and_then(|digits| digits.parse().ok())
}

fn format_number(value: u64, width: Option<usize>) -> String {
    match width {
        Some(width) => format!("{value:0width$}"),
        None => value.to_string(),
    }
}

fn track_kind(adaptation: &XmlAdaptationSet) -> Option<TrackKind> {
    let hint = adaptation
        .content_type
        .clone()
        .or_else(|| adaptation.mime_type.clone())
        .or_else(|| {
            adaptation
                .representations
                .first()
                .and_then(|rep| rep.mime_type.clone())
        })
        .unwrap_or_default()
        .to_ascii_lowercase();
    if hint.contains("video") {
        return Some(TrackKind::Video);
    }
    if hint.contains("audio") {
        return Some(TrackKind::Audio);
    }
    if hint.contains("text") || hint.contains("ttml") || hint.contains("vtt") {
        return Some(TrackKind::Subtitle);
    }
    if adaptation
        .representations
        .iter()
        .any(|rep| rep.width.is_some() || rep.height.is_some())
    {
        return Some(TrackKind::Video);
    }
    None
}

fn kind_index(kind: TrackKind) -> usize {
    match kind {
        TrackKind::Video => 0,
        TrackKind::Audio => 1,
        TrackKind::Subtitle => 2,
    }
}

fn kind_prefix(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Video => "video",
        TrackKind::Audio => "audio",
        TrackKind::Subtitle => "sub",
    }
}

fn is_protected(protections: &[XmlContentProtection]) -> bool {
    protections.iter().any(|cp| {
        let scheme = cp.scheme_id_uri.as_deref().unwrap_or("");
        scheme.to_ascii_lowercase().contains(CENC_SCHEME)
            || DrmSystem::from_scheme_id(scheme).is_some()
    })
}

fn extract_default_kid(protections: &[XmlContentProtection]) -> Option<String> {
    protections
        .iter()
        .filter(|cp| {
            cp.scheme_id_uri
                .as_deref()
                .map(|scheme| scheme.to_ascii_lowercase().contains(CENC_SCHEME))
                .unwrap_or(false)
        })
        .find_map(|cp| cp.default_kid.clone())
        .map(|kid| kid.to_ascii_lowercase())
}

/// Lift validated PSSH/PRO payloads out of ContentProtection elements.
/// Invalid blobs are discarded here so downstream code never sees them.
fn extract_pssh_records(
    protections: &[XmlContentProtection],
    kind: TrackKind,
    default_kid: Option<&str>,
) -> Vec<PsshRecord> {
    let mut records = Vec::new();
    for cp in protections {
        let Some(system) = cp
            .scheme_id_uri
            .as_deref()
            .and_then(DrmSystem::from_scheme_id)
        else {
            continue;
        };
        let mut candidates = Vec::new();
        if let Some(pssh) = cp.pssh.as_ref().and_then(|text| text.value.clone()) {
            candidates.push(pssh);
        }
        if system == DrmSystem::Playready {
            if let Some(pro) = cp.pro.as_ref().and_then(|text| text.value.clone()) {
                candidates.push(pro);
            }
        }
        for data in candidates {
            let data = data.trim().to_string();
            if data.is_empty() || !validate_pssh(system, &data) {
                debug!(system = %system, "discarding invalid protection payload");
                continue;
            }
            let record = PsshRecord {
                system,
                data,
                kid: default_kid.map(str::to_string),
                track: kind_prefix(kind).to_string(),
            };
            if !records.contains(&record) {
                records.push(record);
            }
        }
    }
    records
}

fn container_from_path(path: &str) -> SegmentContainer {
    let clean = path.split(['?', '#', '$']).next().unwrap_or(path);
    match clean.rsplit('.').next().map(str::to_ascii_lowercase) {
        Some(ext) if ext == "mp4" => SegmentContainer::Mp4,
        Some(ext) if ext == "ts" => SegmentContainer::Ts,
        Some(ext) if ext == "aac" => SegmentContainer::Aac,
        _ => SegmentContainer::M4s,
    }
}

fn join_base(current: Url, base: Option<&XmlBaseUrl>) -> ManifestResult<Url> {
    let Some(base) = base.and_then(|b| b.value.as_deref()) else {
        return Ok(current);
    };
    current
        .join(base.trim())
        .map_err(|err| ManifestError::invalid(format!("invalid BaseURL {base}: {err}")))
}

fn resolve(base: &Url, uri: &str) -> ManifestResult<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") || uri.starts_with("file://") {
        return Ok(uri.to_string());
    }
    base.join(uri)
        .map(|joined| joined.to_string())
        .map_err(|err| ManifestError::invalid(format!("cannot resolve uri {uri}: {err}")))
}

/// Parse an `xs:duration` such as `PT1H30M12.5S` or `P1DT2H`.
fn parse_xs_duration(value: &str) -> Option<f64> {
    let rest = value.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };
    let mut seconds = 0.0f64;
    let scan = |part: &str, units: &[(char, f64)]| -> Option<f64> {
        let mut total = 0.0;
        let mut number = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
            } else {
                let factor = units.iter().find(|(unit, _)| *unit == c)?.1;
                total += number.parse::<f64>().ok()? * factor;
                number.clear();
            }
        }
        if number.is_empty() {
            Some(total)
        } else {
            None
        }
    };
    seconds += scan(date_part, &[('Y', 31_536_000.0), ('M', 2_592_000.0), ('D', 86_400.0)])?;
    if let Some(time_part) = time_part {
        seconds += scan(time_part, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    }
    Some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn manifest_url() -> Url {
        Url::parse("https://cdn.example/content/stream.mpd").unwrap()
    }

    fn widevine_pssh() -> String {
        let uuid = hex::decode(DrmSystem::Widevine.uuid().replace('-', "")).unwrap();
        let payload = b"init-data";
        let size = 32 + payload.len() as u32;
        let mut data = Vec::new();
        data.extend_from_slice(&size.to_be_bytes());
        data.extend_from_slice(b"pssh");
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(&uuid);
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        data.extend_from_slice(payload);
        BASE64.encode(data)
    }

    fn number_template_mpd() -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013" mediaPresentationDuration="PT40S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" cenc:default_KID="11112222-3333-4444-5555-666677778888"/>
      <ContentProtection schemeIdUri="urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed">
        <cenc:pssh>{pssh}</cenc:pssh>
      </ContentProtection>
      <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/seg_$Number%05d$.m4s" startNumber="1" duration="40000" timescale="10000"/>
      <Representation id="v1080" bandwidth="4500000" codecs="avc1.640028" width="1920" height="1080"/>
      <Representation id="v720" bandwidth="1400000" codecs="avc1.64001f" width="1280" height="720"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" lang="it">
      <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/seg_$Number$.m4s" startNumber="1" duration="40000" timescale="10000"/>
      <Representation id="a-it" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
</MPD>"#,
            pssh = widevine_pssh()
        )
    }

    #[test]
    fn number_template_expands() {
        let reps = parse_mpd(&number_template_mpd(), &manifest_url()).unwrap();
        assert_eq!(reps.len(), 3);
        let video = &reps[0];
        assert_eq!(video.id, "v1080");
        assert_eq!(video.kind, TrackKind::Video);
        assert_eq!(video.resolution, Some((1920, 1080)));
        assert!(video.encrypted);
        assert_eq!(
            video.default_kid.as_deref(),
            Some("11112222-3333-4444-5555-666677778888")
        );
        assert_eq!(video.pssh.len(), 1);
        assert_eq!(video.pssh[0].system, DrmSystem::Widevine);
        let SegmentPlan::Segments {
            init_url,
            urls,
            container,
            encryption,
        } = &video.segments
        else {
            panic!("expected segmented plan");
        };
        assert_eq!(
            init_url.as_deref(),
            Some("https://cdn.example/content/v1080/init.mp4")
        );
        assert_eq!(urls.len(), 10);
        assert_eq!(
            urls[0],
            "https://cdn.example/content/v1080/seg_00001.m4s"
        );
        assert_eq!(*container, SegmentContainer::M4s);
        assert_eq!(
            encryption.as_ref().map(|e| e.method),
            Some(EncryptionMethod::Cenc)
        );

        let audio = &reps[2];
        assert_eq!(audio.kind, TrackKind::Audio);
        assert_eq!(audio.language.as_deref(), Some("it"));
        assert!(!audio.encrypted);
    }

    #[test]
    fn segment_timeline_expands() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011">
  <Period>
    <AdaptationSet contentType="video">
      <SegmentTemplate media="seg_$Time$.m4s" timescale="1000">
        <SegmentTimeline>
          <S t="0" d="4000" r="2"/>
          <S d="2000"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v1" bandwidth="1000000" width="1280" height="720"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let reps = parse_mpd(mpd, &manifest_url()).unwrap();
        let SegmentPlan::Segments { urls, .. } = &reps[0].segments else {
            panic!("expected segments");
        };
        assert_eq!(
            urls.iter()
                .map(|u| u.rsplit('/').next().unwrap())
                .collect::<Vec<_>>(),
            vec![
                "seg_0.m4s",
                "seg_4000.m4s",
                "seg_8000.m4s",
                "seg_12000.m4s"
            ]
        );
        assert!((reps[0].duration_s - 14.0).abs() < 1e-9);
    }

    #[test]
    fn single_file_base_url() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" mediaPresentationDuration="PT2M">
  <Period>
    <AdaptationSet contentType="video">
      <Representation id="v1" bandwidth="2000000" width="1920" height="1080">
        <BaseURL>movie_1080.mp4</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let reps = parse_mpd(mpd, &manifest_url()).unwrap();
        assert_eq!(
            reps[0].segments,
            SegmentPlan::SingleFile {
                url: "https://cdn.example/content/movie_1080.mp4".into()
            }
        );
        assert!((reps[0].duration_s - 120.0).abs() < 1e-9);
    }

    #[test]
    fn segment_list_parses() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011">
  <Period duration="PT8S">
    <AdaptationSet contentType="audio" lang="en">
      <Representation id="a1" bandwidth="96000">
        <SegmentList>
          <Initialization sourceURL="audio/init.mp4"/>
          <SegmentURL media="audio/seg1.m4s"/>
          <SegmentURL media="audio/seg2.m4s"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let reps = parse_mpd(mpd, &manifest_url()).unwrap();
        let SegmentPlan::Segments { init_url, urls, .. } = &reps[0].segments else {
            panic!("expected segments");
        };
        assert_eq!(
            init_url.as_deref(),
            Some("https://cdn.example/content/audio/init.mp4")
        );
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn invalid_pssh_discarded() {
        let mpd = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011">
  <Period duration="PT8S">
    <AdaptationSet contentType="video">
      <ContentProtection schemeIdUri="urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed">
        <cenc:pssh>bm90IGEgcHNzaA==</cenc:pssh>
      </ContentProtection>
      <SegmentTemplate media="seg_$Number$.m4s" duration="4" timescale="1"/>
      <Representation id="v1" bandwidth="1" width="640" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let reps = parse_mpd(mpd, &manifest_url()).unwrap();
        assert!(reps[0].pssh.is_empty());
        assert!(reps[0].encrypted);
    }

    #[test]
    fn xs_duration_forms() {
        assert_eq!(parse_xs_duration("PT30S"), Some(30.0));
        assert_eq!(parse_xs_duration("PT1M30S"), Some(90.0));
        assert_eq!(parse_xs_duration("PT1H2M3.5S"), Some(3723.5));
        assert_eq!(parse_xs_duration("P1DT1H"), Some(90_000.0));
        assert_eq!(parse_xs_duration("bogus"), None);
    }

    #[test]
    fn substitution_forms() {
        assert_eq!(
            substitute("$RepresentationID$/seg_$Number%05d$.m4s", "v1", 9, Some(7), None),
            "v1/seg_00007.m4s"
        );
        assert_eq!(
            substitute("b_$Bandwidth$_t_$Time$.m4s", "v1", 9, None, Some(4000)),
            "b_9_t_4000.m4s"
        );
    }
}
