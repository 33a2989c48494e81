use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};

use crate::http::HttpClient;
use crate::mux::MediaTrackFile;
use crate::select::ExternalSubtitle;

/// Downloads sidecar WebVTT/SRT files that live outside the manifest.
/// A failed subtitle is a warning, never a job failure.
pub struct SubtitleFetcher {
    http: HttpClient,
    headers: HashMap<String, String>,
}

impl SubtitleFetcher {
    pub fn new(http: HttpClient, headers: HashMap<String, String>) -> Self {
        Self { http, headers }
    }

    pub async fn download_all(
        &self,
        subtitles: &[ExternalSubtitle],
        dir: &Path,
        name: &str,
    ) -> Vec<MediaTrackFile> {
        let mut downloaded = Vec::new();
        for subtitle in subtitles {
            let file_name = format!("{name}.{}.{}", subtitle.language, subtitle.format);
            let path = dir.join(&file_name);
            match self.http.get(&subtitle.url, &self.headers).await {
                Ok(response) if response.is_success() && !response.body.is_empty() => {
                    if let Err(err) = tokio::fs::write(&path, &response.body).await {
                        warn!(url = %subtitle.url, error = %err, "failed to write subtitle file");
                        continue;
                    }
                    info!(language = %subtitle.language, file = %file_name, "external subtitle downloaded");
                    downloaded.push(MediaTrackFile {
                        path,
                        language: subtitle.language.clone(),
                    });
                }
                Ok(response) => {
                    warn!(
                        url = %subtitle.url,
                        status = response.status,
                        "external subtitle fetch failed"
                    );
                }
                Err(err) => {
                    warn!(url = %subtitle.url, error = %err, "external subtitle fetch failed");
                }
            }
        }
        downloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSection;

    #[tokio::test]
    async fn downloads_present_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("subs_it.vtt");
        std::fs::write(&source, "WEBVTT\n\n00:00.000 --> 00:01.000\nciao\n").unwrap();

        let subtitles = vec![
            ExternalSubtitle {
                url: format!("file://{}", source.display()),
                language: "it".into(),
                format: "vtt".into(),
            },
            ExternalSubtitle {
                url: format!("file://{}/absent.srt", dir.path().display()),
                language: "de".into(),
                format: "srt".into(),
            },
        ];

        let fetcher = SubtitleFetcher::new(
            HttpClient::new(&NetworkSection::default()).unwrap(),
            HashMap::new(),
        );
        let out_dir = dir.path().join("job");
        std::fs::create_dir_all(&out_dir).unwrap();
        let tracks = fetcher.download_all(&subtitles, &out_dir, "movie").await;

        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].language, "it");
        assert!(out_dir.join("movie.it.vtt").exists());
        assert!(!out_dir.join("movie.de.srt").exists());
    }
}
