use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::{Representation, StreamSet, TrackKind};

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("stream set has no video representation")]
    NoVideo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPolicy {
    Best,
    Worst,
    Height(u32),
}

impl ResolutionPolicy {
    /// Accepts `best`, `worst`, `1080p` or a bare height. Anything else
    /// falls back to `Best`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "best" | "" => ResolutionPolicy::Best,
            "worst" => ResolutionPolicy::Worst,
            other => other
                .strip_suffix('p')
                .unwrap_or(other)
                .parse()
                .map(ResolutionPolicy::Height)
                .unwrap_or(ResolutionPolicy::Best),
        }
    }
}

/// The policy slice the selector needs, lifted out of the caller input.
#[derive(Debug, Clone, Default)]
pub struct SelectionPolicy {
    pub resolution: String,
    pub audio_languages: Vec<String>,
    pub subtitle_languages: Vec<String>,
    /// Keep Forced/SDH/CC subtitle renditions.
    pub include_special_subtitles: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSubtitle {
    pub url: String,
    pub language: String,
    pub format: String,
}

#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub video: Representation,
    pub audio: Vec<Representation>,
    pub subtitles: Vec<Representation>,
    pub external_subs: Vec<ExternalSubtitle>,
}

/// Emitted when a language list matched nothing and the first available
/// track was substituted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionFallback {
    pub kind: TrackKind,
    pub selected: String,
}

pub fn select_tracks(
    stream_set: &StreamSet,
    policy: &SelectionPolicy,
    external_subs: &[ExternalSubtitle],
) -> Result<(DownloadPlan, Vec<SelectionFallback>), SelectError> {
    let mut warnings = Vec::new();

    let video = select_video(stream_set, ResolutionPolicy::parse(&policy.resolution))
        .ok_or(SelectError::NoVideo)?
        .clone();

    let audio_tracks: Vec<&Representation> = stream_set.of_kind(TrackKind::Audio).collect();
    let audio = match select_by_language(&audio_tracks, &policy.audio_languages, true) {
        LanguageSelection::Matched(tracks) => tracks,
        LanguageSelection::Fallback(track) => {
            warnings.push(SelectionFallback {
                kind: TrackKind::Audio,
                selected: track_label(track),
            });
            vec![track]
        }
        LanguageSelection::None => Vec::new(),
    };

    let subtitle_tracks: Vec<&Representation> = stream_set
        .of_kind(TrackKind::Subtitle)
        .filter(|rep| policy.include_special_subtitles || !rep.variant.is_special())
        .collect();
    let subtitles = match select_by_language(&subtitle_tracks, &policy.subtitle_languages, false) {
        LanguageSelection::Matched(tracks) => tracks,
        LanguageSelection::Fallback(track) => {
            warnings.push(SelectionFallback {
                kind: TrackKind::Subtitle,
                selected: track_label(track),
            });
            vec![track]
        }
        LanguageSelection::None => Vec::new(),
    };

    let external_subs = filter_external_subs(external_subs, &policy.subtitle_languages);

    Ok((
        DownloadPlan {
            video,
            audio: audio.into_iter().cloned().collect(),
            subtitles: subtitles.into_iter().cloned().collect(),
            external_subs,
        },
        warnings,
    ))
}

fn select_video(stream_set: &StreamSet, policy: ResolutionPolicy) -> Option<&Representation> {
    let videos: Vec<&Representation> = stream_set.of_kind(TrackKind::Video).collect();
    match policy {
        ResolutionPolicy::Best => videos.iter().max_by_key(|rep| rep.bandwidth).copied(),
        ResolutionPolicy::Worst => videos.iter().min_by_key(|rep| rep.bandwidth).copied(),
        ResolutionPolicy::Height(height) => videos
            .iter()
            .filter(|rep| rep.height() == Some(height))
            .max_by_key(|rep| rep.bandwidth)
            .copied()
            // No representation at the requested height: take the best.
            .or_else(|| videos.iter().max_by_key(|rep| rep.bandwidth).copied()),
    }
}

enum LanguageSelection<'a> {
    Matched(Vec<&'a Representation>),
    Fallback(&'a Representation),
    None,
}

fn is_all_sentinel(languages: &[String]) -> bool {
    languages
        .iter()
        .any(|lang| lang == "*" || lang.eq_ignore_ascii_case("all"))
}

/// `auto_first` makes an empty policy list pick the first available track
/// (audio behavior); subtitles stay unselected unless asked for.
fn select_by_language<'a>(
    tracks: &[&'a Representation],
    languages: &[String],
    auto_first: bool,
) -> LanguageSelection<'a> {
    if tracks.is_empty() {
        return LanguageSelection::None;
    }
    if is_all_sentinel(languages) {
        return LanguageSelection::Matched(tracks.to_vec());
    }
    if languages.is_empty() {
        if auto_first {
            return LanguageSelection::Fallback(tracks[0]);
        }
        return LanguageSelection::None;
    }
    let matched: Vec<&Representation> = tracks
        .iter()
        .filter(|rep| languages.iter().any(|lang| rep.matches_language(lang)))
        .copied()
        .collect();
    if matched.is_empty() {
        LanguageSelection::Fallback(tracks[0])
    } else {
        LanguageSelection::Matched(matched)
    }
}

fn filter_external_subs(
    external: &[ExternalSubtitle],
    languages: &[String],
) -> Vec<ExternalSubtitle> {
    if external.is_empty() {
        return Vec::new();
    }
    if is_all_sentinel(languages) {
        return external.to_vec();
    }
    external
        .iter()
        .filter(|sub| {
            languages
                .iter()
                .any(|lang| sub.language.to_ascii_lowercase().contains(&lang.to_ascii_lowercase()))
        })
        .cloned()
        .collect()
}

fn track_label(rep: &Representation) -> String {
    rep.language
        .clone()
        .or_else(|| rep.language_long.clone())
        .unwrap_or_else(|| rep.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        ManifestKind, SegmentContainer, SegmentPlan, TrackVariant,
    };

    fn rep(
        id: &str,
        kind: TrackKind,
        bandwidth: u64,
        height: Option<u32>,
        language: Option<&str>,
        variant: TrackVariant,
    ) -> Representation {
        Representation {
            id: id.into(),
            kind,
            codec: "test".into(),
            bandwidth,
            resolution: height.map(|h| (h * 16 / 9, h)),
            language: language.map(str::to_string),
            language_long: None,
            variant,
            segments: SegmentPlan::Segments {
                init_url: None,
                urls: vec![format!("https://cdn/{id}/seg0.ts")],
                container: SegmentContainer::Ts,
                encryption: None,
            },
            encrypted: false,
            default_kid: None,
            pssh: Vec::new(),
            duration_s: 4.0,
        }
    }

    fn stream_set() -> StreamSet {
        StreamSet {
            kind: ManifestKind::Hls,
            representations: vec![
                rep("v-1080", TrackKind::Video, 4_500_000, Some(1080), None, TrackVariant::None),
                rep("v-720", TrackKind::Video, 1_400_000, Some(720), None, TrackVariant::None),
                rep("a-it", TrackKind::Audio, 128_000, None, Some("it"), TrackVariant::None),
                rep("a-en", TrackKind::Audio, 128_000, None, Some("en"), TrackVariant::None),
                rep("s-it", TrackKind::Subtitle, 0, None, Some("it"), TrackVariant::None),
                rep("s-it-f", TrackKind::Subtitle, 0, None, Some("it"), TrackVariant::Forced),
            ],
        }
    }

    #[test]
    fn resolution_policy_parsing() {
        assert_eq!(ResolutionPolicy::parse("best"), ResolutionPolicy::Best);
        assert_eq!(ResolutionPolicy::parse("WORST"), ResolutionPolicy::Worst);
        assert_eq!(ResolutionPolicy::parse("1080p"), ResolutionPolicy::Height(1080));
        assert_eq!(ResolutionPolicy::parse("720"), ResolutionPolicy::Height(720));
        assert_eq!(ResolutionPolicy::parse("gibberish"), ResolutionPolicy::Best);
    }

    #[test]
    fn best_picks_max_bandwidth() {
        let set = stream_set();
        let policy = SelectionPolicy {
            resolution: "best".into(),
            audio_languages: vec!["it".into()],
            ..Default::default()
        };
        let (plan, warnings) = select_tracks(&set, &policy, &[]).unwrap();
        assert_eq!(plan.video.id, "v-1080");
        assert_eq!(plan.audio.len(), 1);
        assert_eq!(plan.audio[0].id, "a-it");
        assert!(warnings.is_empty());
    }

    #[test]
    fn height_match_with_fallback_to_best() {
        let set = stream_set();
        let policy = SelectionPolicy {
            resolution: "720p".into(),
            ..Default::default()
        };
        let (plan, _) = select_tracks(&set, &policy, &[]).unwrap();
        assert_eq!(plan.video.id, "v-720");

        let policy = SelectionPolicy {
            resolution: "480p".into(),
            ..Default::default()
        };
        let (plan, _) = select_tracks(&set, &policy, &[]).unwrap();
        assert_eq!(plan.video.id, "v-1080");
    }

    #[test]
    fn unmatched_language_falls_back_with_warning() {
        let set = stream_set();
        let policy = SelectionPolicy {
            resolution: "best".into(),
            audio_languages: vec!["ja".into()],
            ..Default::default()
        };
        let (plan, warnings) = select_tracks(&set, &policy, &[]).unwrap();
        assert_eq!(plan.audio[0].id, "a-it");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, TrackKind::Audio);
    }

    #[test]
    fn all_sentinel_selects_everything() {
        let set = stream_set();
        let policy = SelectionPolicy {
            resolution: "best".into(),
            audio_languages: vec!["all".into()],
            subtitle_languages: vec!["*".into()],
            include_special_subtitles: false,
        };
        let (plan, _) = select_tracks(&set, &policy, &[]).unwrap();
        assert_eq!(plan.audio.len(), 2);
        // Forced variant excluded without the opt-in.
        assert_eq!(plan.subtitles.len(), 1);
        assert_eq!(plan.subtitles[0].id, "s-it");
    }

    #[test]
    fn special_subtitles_kept_on_opt_in() {
        let set = stream_set();
        let policy = SelectionPolicy {
            resolution: "best".into(),
            subtitle_languages: vec!["all".into()],
            include_special_subtitles: true,
            ..Default::default()
        };
        let (plan, _) = select_tracks(&set, &policy, &[]).unwrap();
        assert_eq!(plan.subtitles.len(), 2);
    }

    #[test]
    fn external_subs_filtered_by_language() {
        let set = stream_set();
        let external = vec![
            ExternalSubtitle {
                url: "https://subs/it.vtt".into(),
                language: "it".into(),
                format: "vtt".into(),
            },
            ExternalSubtitle {
                url: "https://subs/de.srt".into(),
                language: "de".into(),
                format: "srt".into(),
            },
        ];
        let policy = SelectionPolicy {
            resolution: "best".into(),
            subtitle_languages: vec!["it".into()],
            ..Default::default()
        };
        let (plan, _) = select_tracks(&set, &policy, &external).unwrap();
        assert_eq!(plan.external_subs.len(), 1);
        assert_eq!(plan.external_subs[0].language, "it");
    }

    #[test]
    fn empty_audio_policy_auto_selects_first() {
        let set = stream_set();
        let policy = SelectionPolicy {
            resolution: "best".into(),
            ..Default::default()
        };
        let (plan, warnings) = select_tracks(&set, &policy, &[]).unwrap();
        assert_eq!(plan.audio.len(), 1);
        assert_eq!(plan.audio[0].id, "a-it");
        assert_eq!(warnings.len(), 1);
        assert!(plan.subtitles.is_empty());
    }
}
