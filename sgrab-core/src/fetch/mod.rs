mod decrypt;
mod mp4box;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

pub use decrypt::{sequence_iv, DecryptError, SegmentCipher};
pub use mp4box::filter_moof_mdat;

use crate::config::DownloadSection;
use crate::event::{DownloadEvent, EventSink};
use crate::http::{HttpClient, HttpError};
use crate::manifest::{
    EncryptionMethod, Representation, SegmentContainer, SegmentEncryption, SegmentPlan, TrackKind,
};
use crate::progress::ProgressTracker;

/// A track is still considered complete with sporadic gaps: ad-stitched
/// HLS streams routinely 404 a handful of segments.
const GAP_COMPLETION_RATE: f64 = 0.90;
const GAP_ABSOLUTE_LIMIT: usize = 30;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("track incomplete: {failed} of {total} segments failed")]
    TrackIncomplete { failed: usize, total: usize },
    #[error("failed to fetch AES key from {url}: {reason}")]
    Key { url: String, reason: String },
    #[error("init segment download failed: {reason}")]
    Init { reason: String },
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    #[error("download cancelled")]
    Cancelled,
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Per-track bookkeeping. Exactly one writer (the ordered-write loop)
/// mutates this; the progress reporter only ever sees snapshots.
#[derive(Debug)]
pub struct FetchState {
    pub total: usize,
    pub downloaded: BTreeSet<usize>,
    pub failed: BTreeSet<usize>,
    pub retry_counts: HashMap<usize, u32>,
    pub bytes_written: u64,
    pub started_at: Instant,
    pub last_event_at: Instant,
}

impl FetchState {
    fn new(total: usize) -> Self {
        let now = Instant::now();
        Self {
            total,
            downloaded: BTreeSet::new(),
            failed: BTreeSet::new(),
            retry_counts: HashMap::new(),
            bytes_written: 0,
            started_at: now,
            last_event_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackReport {
    pub track: String,
    pub kind: TrackKind,
    pub output_path: PathBuf,
    pub bytes_written: u64,
    pub total_segments: usize,
    pub failed_segments: usize,
    pub max_retry_seen: u32,
    pub total_retries: u64,
    pub duration_s: f64,
}

struct SegmentContext {
    http: HttpClient,
    headers: HashMap<String, String>,
    max_retries: u32,
    timeout_cap_s: u64,
    cipher: Option<SegmentCipher>,
}

struct SegmentOutcome {
    content: Option<Vec<u8>>,
    attempts: u32,
    last_status: Option<u16>,
}

/// Sliding-window ordered-write downloader for one track: keep up to `W`
/// transfers in flight, but always await and write the segment at
/// `next_to_write`, so the output file grows in strict index order with
/// no reorder buffer.
pub struct SegmentFetcher {
    http: HttpClient,
    headers: HashMap<String, String>,
    download: DownloadSection,
    sink: EventSink,
}

impl SegmentFetcher {
    pub fn new(
        http: HttpClient,
        headers: HashMap<String, String>,
        download: DownloadSection,
        sink: EventSink,
    ) -> Self {
        Self {
            http,
            headers,
            download,
            sink,
        }
    }

    pub async fn download_track(
        &self,
        track: &str,
        representation: &Representation,
        output_path: &Path,
    ) -> FetchResult<TrackReport> {
        match &representation.segments {
            SegmentPlan::SingleFile { url } => {
                self.download_single_file(track, representation, url, output_path)
                    .await
            }
            SegmentPlan::Segments {
                init_url,
                urls,
                container,
                encryption,
            } => {
                self.download_segmented(
                    track,
                    representation,
                    init_url.as_deref(),
                    urls,
                    *container,
                    encryption.as_ref(),
                    output_path,
                )
                .await
            }
        }
    }

    async fn download_single_file(
        &self,
        track: &str,
        representation: &Representation,
        url: &str,
        output_path: &Path,
    ) -> FetchResult<TrackReport> {
        self.sink.emit(DownloadEvent::TrackStarted {
            track: track.to_string(),
            kind: representation.kind,
            segments: 0,
        });
        let tracker = ProgressTracker::new(0);
        let cancel = self.sink.cancel_flag().clone();

        let transfer = self.http.stream_to_file(url, &self.headers, output_path, |chunk| {
            tracker.record_bytes(chunk);
            if let Some(snapshot) = tracker.throttled_snapshot() {
                self.sink.emit(DownloadEvent::Progress {
                    track: track.to_string(),
                    snapshot,
                });
            }
        });
        let bytes_written = tokio::select! {
            result = transfer => result?,
            _ = cancel.cancelled() => {
                return Err(FetchError::Cancelled);
            }
        };

        self.sink.emit(DownloadEvent::TrackDone {
            track: track.to_string(),
            bytes_total: bytes_written,
            failed: 0,
        });
        Ok(TrackReport {
            track: track.to_string(),
            kind: representation.kind,
            output_path: output_path.to_path_buf(),
            bytes_written,
            total_segments: 0,
            failed_segments: 0,
            max_retry_seen: 0,
            total_retries: 0,
            duration_s: representation.duration_s,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_segmented(
        &self,
        track: &str,
        representation: &Representation,
        init_url: Option<&str>,
        urls: &[String],
        container: SegmentContainer,
        encryption: Option<&SegmentEncryption>,
        output_path: &Path,
    ) -> FetchResult<TrackReport> {
        let total = urls.len();
        let workers = self.worker_count(representation.kind).max(1);
        let cancel = self.sink.cancel_flag().clone();

        self.sink.emit(DownloadEvent::TrackStarted {
            track: track.to_string(),
            kind: representation.kind,
            segments: total,
        });

        let cipher = self.build_cipher(encryption).await?;
        // Full-MP4 segment streams carry no init segment; every segment
        // after the first is reduced to its moof/mdat boxes.
        let mp4_filter_mode = container == SegmentContainer::Mp4 && init_url.is_none();

        let context = Arc::new(SegmentContext {
            http: self.http.clone(),
            headers: self.headers.clone(),
            max_retries: self.download.max_retries.max(1),
            timeout_cap_s: self.download.segment_timeout_s,
            cipher,
        });

        let mut file = fs::File::create(output_path)
            .await
            .map_err(|source| FetchError::Io {
                path: output_path.to_path_buf(),
                source,
            })?;
        let tracker = ProgressTracker::new(total);
        let mut state = FetchState::new(total);

        if let Some(init_url) = init_url {
            let init = self.fetch_init(&context, init_url).await?;
            file.write_all(&init)
                .await
                .map_err(|source| FetchError::Io {
                    path: output_path.to_path_buf(),
                    source,
                })?;
            state.bytes_written += init.len() as u64;
            tracker.record_bytes(init.len() as u64);
        }

        let mut in_flight: HashMap<usize, JoinHandle<SegmentOutcome>> = HashMap::new();
        let mut next_to_download = 0usize;
        let mut next_to_write = 0usize;
        let mut max_retry_seen = 0u32;
        let mut total_retries = 0u64;

        while next_to_write < total && !cancel.is_cancelled() {
            while in_flight.len() < workers && next_to_download < total {
                let index = next_to_download;
                let url = urls[index].clone();
                let task_context = Arc::clone(&context);
                let task_cancel = cancel.clone();
                in_flight.insert(
                    index,
                    tokio::spawn(async move {
                        fetch_segment(&task_context, &task_cancel, index, &url).await
                    }),
                );
                next_to_download += 1;
            }

            // Await the segment we need to WRITE, not whichever finishes
            // first. This is what guarantees in-order output.
            let Some(mut handle) = in_flight.remove(&next_to_write) else {
                break;
            };
            let joined = tokio::select! {
                joined = &mut handle => Some(joined),
                _ = cancel.cancelled() => None,
            };
            let Some(joined) = joined else {
                handle.abort();
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(track, index = next_to_write, error = %err, "segment task panicked");
                    SegmentOutcome {
                        content: None,
                        attempts: context.max_retries,
                        last_status: None,
                    }
                }
            };

            max_retry_seen = max_retry_seen.max(outcome.attempts);
            total_retries += u64::from(outcome.attempts);
            state.retry_counts.insert(next_to_write, outcome.attempts);
            state.last_event_at = Instant::now();

            match outcome.content {
                Some(content) => {
                    let payload = if mp4_filter_mode && next_to_write > 0 {
                        filter_moof_mdat(&content)
                    } else {
                        content
                    };
                    file.write_all(&payload)
                        .await
                        .map_err(|source| FetchError::Io {
                            path: output_path.to_path_buf(),
                            source,
                        })?;
                    state.bytes_written += payload.len() as u64;
                    state.downloaded.insert(next_to_write);
                    tracker.record_segment(payload.len() as u64);
                    self.sink.emit(DownloadEvent::SegmentDone {
                        track: track.to_string(),
                        index: next_to_write,
                        bytes: payload.len() as u64,
                        attempts: outcome.attempts,
                    });
                }
                None => {
                    state.failed.insert(next_to_write);
                    tracker.record_failure();
                    self.sink.emit(DownloadEvent::SegmentFailed {
                        track: track.to_string(),
                        index: next_to_write,
                        last_status: outcome.last_status,
                    });
                }
            }
            if let Some(snapshot) = tracker.throttled_snapshot() {
                self.sink.emit(DownloadEvent::Progress {
                    track: track.to_string(),
                    snapshot,
                });
            }
            next_to_write += 1;
        }

        file.flush().await.map_err(|source| FetchError::Io {
            path: output_path.to_path_buf(),
            source,
        })?;

        if cancel.is_cancelled() {
            for (_, handle) in in_flight.drain() {
                handle.abort();
            }
            return Err(FetchError::Cancelled);
        }

        let failed = state.failed.len();
        let completion_rate = if total > 0 {
            (total - failed) as f64 / total as f64
        } else {
            1.0
        };
        if completion_rate < GAP_COMPLETION_RATE && failed > GAP_ABSOLUTE_LIMIT {
            let reason = format!("{failed} of {total} segments failed");
            self.sink.emit(DownloadEvent::TrackFailed {
                track: track.to_string(),
                reason,
            });
            return Err(FetchError::TrackIncomplete { failed, total });
        }

        if failed > 0 {
            debug!(
                track,
                failed,
                max_retry_seen,
                total_retries,
                missing = ?state.failed.iter().take(10).collect::<Vec<_>>(),
                "track completed with segment gaps"
            );
        }
        self.sink.emit(DownloadEvent::TrackDone {
            track: track.to_string(),
            bytes_total: state.bytes_written,
            failed,
        });
        Ok(TrackReport {
            track: track.to_string(),
            kind: representation.kind,
            output_path: output_path.to_path_buf(),
            bytes_written: state.bytes_written,
            total_segments: total,
            failed_segments: failed,
            max_retry_seen,
            total_retries,
            duration_s: representation.duration_s,
        })
    }

    fn worker_count(&self, kind: TrackKind) -> usize {
        match kind {
            TrackKind::Video => self.download.video_workers,
            TrackKind::Audio | TrackKind::Subtitle => self.download.audio_workers,
        }
    }

    /// Fetch and cache the AES-128 key once per track. CENC tracks are
    /// written encrypted and decrypted by the mux stage, never here.
    async fn build_cipher(
        &self,
        encryption: Option<&SegmentEncryption>,
    ) -> FetchResult<Option<SegmentCipher>> {
        let Some(encryption) = encryption else {
            return Ok(None);
        };
        match encryption.method {
            EncryptionMethod::Cenc => Ok(None),
            EncryptionMethod::SampleAes => {
                warn!("SAMPLE-AES track: segments pass through undecrypted");
                Ok(None)
            }
            EncryptionMethod::Aes128 => {
                let Some(key_uri) = encryption.key_uri.as_deref() else {
                    return Err(FetchError::Key {
                        url: String::new(),
                        reason: "AES-128 key without URI".into(),
                    });
                };
                let response = self.http.get(key_uri, &self.headers).await?;
                if !response.is_success() {
                    return Err(FetchError::Key {
                        url: key_uri.to_string(),
                        reason: format!("http {}", response.status),
                    });
                }
                let key: [u8; 16] =
                    response
                        .body
                        .as_slice()
                        .try_into()
                        .map_err(|_| FetchError::Key {
                            url: key_uri.to_string(),
                            reason: format!("expected 16 key bytes, got {}", response.body.len()),
                        })?;
                debug!(key_uri, "fetched AES-128 content key");
                Ok(Some(SegmentCipher::new(
                    key,
                    encryption.iv,
                    Some(encryption.media_sequence),
                )))
            }
        }
    }

    /// The init segment is fetched out-of-window, before any worker
    /// spawns, and lands at offset 0 of the output file.
    async fn fetch_init(&self, context: &SegmentContext, init_url: &str) -> FetchResult<Vec<u8>> {
        let mut last_reason = String::new();
        for attempt in 0..context.max_retries {
            let timeout = attempt_timeout(context.timeout_cap_s, attempt);
            match self
                .http
                .get_with_timeout(init_url, &context.headers, Some(timeout))
                .await
            {
                Ok(response) if response.status == 200 => {
                    let mut content = response.body;
                    // Only an explicit IV applies to the init segment;
                    // sequence-derived IVs are per media segment.
                    if let Some(cipher) = context.cipher.as_ref() {
                        if cipher.has_explicit_iv() {
                            content = cipher.decrypt(0, &content)?;
                        }
                    }
                    return Ok(content);
                }
                Ok(response) => {
                    last_reason = format!("http {}", response.status);
                    if response.status == 404 {
                        break;
                    }
                }
                Err(err) => last_reason = err.to_string(),
            }
            sleep(backoff_delay(attempt)).await;
        }
        Err(FetchError::Init {
            reason: last_reason,
        })
    }
}

/// Retry loop for one media segment. 404 is a permanent gap and is never
/// retried; other non-200 statuses and transport errors back off and try
/// again. The per-attempt timeout ramps up with the attempt number.
async fn fetch_segment(
    context: &SegmentContext,
    cancel: &crate::event::CancelFlag,
    index: usize,
    url: &str,
) -> SegmentOutcome {
    let max_retries = context.max_retries;
    let mut last_status = None;
    for attempt in 0..max_retries {
        if cancel.is_cancelled() {
            return SegmentOutcome {
                content: None,
                attempts: attempt,
                last_status,
            };
        }
        let timeout = attempt_timeout(context.timeout_cap_s, attempt);
        match context
            .http
            .get_with_timeout(url, &context.headers, Some(timeout))
            .await
        {
            Ok(response) if response.status == 200 => {
                let mut content = response.body;
                if let Some(cipher) = context.cipher.as_ref() {
                    match cipher.decrypt(index, &content) {
                        Ok(decrypted) => content = decrypted,
                        Err(err) => {
                            warn!(index, error = %err, "segment decryption failed");
                            if attempt + 1 == max_retries {
                                return SegmentOutcome {
                                    content: None,
                                    attempts: max_retries,
                                    last_status: Some(200),
                                };
                            }
                            sleep(backoff_delay(attempt)).await;
                            continue;
                        }
                    }
                }
                return SegmentOutcome {
                    content: Some(content),
                    attempts: attempt,
                    last_status: Some(200),
                };
            }
            Ok(response) if response.status == 404 => {
                warn!(index, url, "segment not found (404), not retrying");
                return SegmentOutcome {
                    content: None,
                    attempts: max_retries,
                    last_status: Some(404),
                };
            }
            Ok(response) => {
                warn!(index, status = response.status, attempt = attempt + 1, "segment request failed");
                last_status = Some(response.status);
            }
            Err(err) => {
                warn!(index, attempt = attempt + 1, error = %err, "segment transfer error");
            }
        }
        if attempt + 1 < max_retries {
            sleep(backoff_delay(attempt)).await;
        }
    }
    SegmentOutcome {
        content: None,
        attempts: max_retries,
        last_status,
    }
}

fn attempt_timeout(cap_s: u64, attempt: u32) -> Duration {
    Duration::from_secs(cap_s.min(10 + u64::from(attempt) * 3))
}

/// First two attempts wait a linear half-second ramp; later ones an
/// exponential ramp capped at two seconds.
fn backoff_delay(attempt: u32) -> Duration {
    let seconds = if attempt < 2 {
        0.5 + 0.5 * f64::from(attempt)
    } else {
        (1.1 * 2f64.powi(attempt as i32)).min(2.0)
    };
    Duration::from_secs_f64(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSection;
    use crate::event::{CancelFlag, EventSink};
    use crate::manifest::TrackVariant;

    fn fixture_track(dir: &Path, count: usize, missing: &[usize]) -> Representation {
        let mut urls = Vec::new();
        for index in 0..count {
            let path = dir.join(format!("seg_{index}.ts"));
            if !missing.contains(&index) {
                std::fs::write(&path, format!("SEGMENT-{index:04};")).unwrap();
            }
            urls.push(format!("file://{}", path.display()));
        }
        Representation {
            id: "video-0".into(),
            kind: TrackKind::Video,
            codec: "avc1".into(),
            bandwidth: 1_000_000,
            resolution: Some((1280, 720)),
            language: None,
            language_long: None,
            variant: TrackVariant::None,
            segments: SegmentPlan::Segments {
                init_url: None,
                urls,
                container: SegmentContainer::Ts,
                encryption: None,
            },
            encrypted: false,
            default_kid: None,
            pssh: Vec::new(),
            duration_s: count as f64 * 4.0,
        }
    }

    fn fetcher(download: DownloadSection) -> (SegmentFetcher, tokio::sync::mpsc::UnboundedReceiver<DownloadEvent>) {
        let cancel = CancelFlag::new();
        let (sink, receiver) = EventSink::channel(cancel);
        let http = HttpClient::new(&NetworkSection::default()).unwrap();
        (
            SegmentFetcher::new(http, HashMap::new(), download, sink),
            receiver,
        )
    }

    fn quick_download() -> DownloadSection {
        DownloadSection {
            video_workers: 4,
            audio_workers: 2,
            max_retries: 2,
            segment_timeout_s: 5,
            concurrent_download: false,
        }
    }

    #[tokio::test]
    async fn segments_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let rep = fixture_track(dir.path(), 25, &[]);
        let output = dir.path().join("out.ts");
        let (fetcher, _events) = fetcher(quick_download());

        let report = fetcher
            .download_track("video", &rep, &output)
            .await
            .unwrap();
        assert_eq!(report.total_segments, 25);
        assert_eq!(report.failed_segments, 0);

        let written = std::fs::read_to_string(&output).unwrap();
        let expected: String = (0..25).map(|i| format!("SEGMENT-{i:04};")).collect();
        assert_eq!(written, expected);
        assert_eq!(report.bytes_written, expected.len() as u64);
    }

    #[tokio::test]
    async fn single_segment_track_degenerates_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let rep = fixture_track(dir.path(), 1, &[]);
        let output = dir.path().join("out.ts");
        let (fetcher, _events) = fetcher(quick_download());
        let report = fetcher
            .download_track("video", &rep, &output)
            .await
            .unwrap();
        assert_eq!(report.total_segments, 1);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "SEGMENT-0000;"
        );
    }

    #[tokio::test]
    async fn gaps_within_threshold_still_complete() {
        let dir = tempfile::tempdir().unwrap();
        // 3 gaps out of 40 stays above the 90% completion threshold.
        let rep = fixture_track(dir.path(), 40, &[5, 17, 30]);
        let output = dir.path().join("out.ts");
        let (fetcher, mut events) = fetcher(quick_download());
        let report = fetcher
            .download_track("video", &rep, &output)
            .await
            .unwrap();
        assert_eq!(report.failed_segments, 3);

        let written = std::fs::read_to_string(&output).unwrap();
        assert!(!written.contains("SEGMENT-0005;"));
        assert!(written.contains("SEGMENT-0006;"));

        let mut saw_404 = false;
        while let Ok(event) = events.try_recv() {
            if let DownloadEvent::SegmentFailed { last_status, .. } = event {
                saw_404 = last_status == Some(404);
            }
        }
        assert!(saw_404);
    }

    #[tokio::test]
    async fn all_segments_missing_fails_without_looping() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Vec<usize> = (0..40).collect();
        let rep = fixture_track(dir.path(), 40, &missing);
        let output = dir.path().join("out.ts");
        let (fetcher, _events) = fetcher(quick_download());
        let result = fetcher.download_track("video", &rep, &output).await;
        assert!(matches!(
            result,
            Err(FetchError::TrackIncomplete { failed: 40, total: 40 })
        ));
    }

    #[tokio::test]
    async fn small_track_tolerates_gaps_by_absolute_count() {
        let dir = tempfile::tempdir().unwrap();
        // 4 gaps out of 10: 60% < 90% but 4 <= 30, so the track passes.
        let rep = fixture_track(dir.path(), 10, &[1, 3, 5, 7]);
        let output = dir.path().join("out.ts");
        let (fetcher, _events) = fetcher(quick_download());
        let report = fetcher
            .download_track("video", &rep, &output)
            .await
            .unwrap();
        assert_eq!(report.failed_segments, 4);
    }

    #[tokio::test]
    async fn init_segment_written_at_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut rep = fixture_track(dir.path(), 3, &[]);
        let init_path = dir.path().join("init.mp4");
        std::fs::write(&init_path, "INIT;").unwrap();
        if let SegmentPlan::Segments { init_url, .. } = &mut rep.segments {
            *init_url = Some(format!("file://{}", init_path.display()));
        }
        let output = dir.path().join("out.mp4");
        let (fetcher, _events) = fetcher(quick_download());
        fetcher
            .download_track("video", &rep, &output)
            .await
            .unwrap();
        let written = std::fs::read_to_string(&output).unwrap();
        assert!(written.starts_with("INIT;SEGMENT-0000;"));
    }

    #[tokio::test]
    async fn mp4_segment_stream_filters_boxes() {
        fn make_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
            let mut data = ((8 + payload.len()) as u32).to_be_bytes().to_vec();
            data.extend_from_slice(box_type);
            data.extend_from_slice(payload);
            data
        }

        let dir = tempfile::tempdir().unwrap();
        let mut first = make_box(b"ftyp", b"iso6");
        first.extend(make_box(b"moov", b"movie-header"));
        std::fs::write(dir.path().join("part_0.mp4"), &first).unwrap();

        let mut second = make_box(b"styp", b"brand");
        second.extend(make_box(b"moof", b"frag"));
        second.extend(make_box(b"mdat", b"data"));
        std::fs::write(dir.path().join("part_1.mp4"), &second).unwrap();

        let urls = vec![
            format!("file://{}/part_0.mp4", dir.path().display()),
            format!("file://{}/part_1.mp4", dir.path().display()),
        ];
        let rep = Representation {
            id: "video-0".into(),
            kind: TrackKind::Video,
            codec: "avc1".into(),
            bandwidth: 0,
            resolution: None,
            language: None,
            language_long: None,
            variant: TrackVariant::None,
            segments: SegmentPlan::Segments {
                init_url: None,
                urls,
                container: SegmentContainer::Mp4,
                encryption: None,
            },
            encrypted: false,
            default_kid: None,
            pssh: Vec::new(),
            duration_s: 8.0,
        };
        let output = dir.path().join("out.mp4");
        let (fetcher, _events) = fetcher(quick_download());
        fetcher
            .download_track("video", &rep, &output)
            .await
            .unwrap();

        let mut expected = first;
        expected.extend(make_box(b"moof", b"frag"));
        expected.extend(make_box(b"mdat", b"data"));
        assert_eq!(std::fs::read(&output).unwrap(), expected);
    }

    #[tokio::test]
    async fn aes_encrypted_track_decrypts_before_write() {
        use cbc::Encryptor;
        use cipher::block_padding::Pkcs7;
        use cipher::{BlockEncryptMut, KeyIvInit};
        type Aes128CbcEnc = Encryptor<aes::Aes128>;

        let dir = tempfile::tempdir().unwrap();
        let key = [3u8; 16];
        std::fs::write(dir.path().join("key.bin"), key).unwrap();

        let media_sequence = 9u64;
        let mut urls = Vec::new();
        for index in 0..2u64 {
            let plaintext = format!("TS-PAYLOAD-{index}");
            let iv = sequence_iv(media_sequence + index);
            let cipher = Aes128CbcEnc::new(&key.into(), &iv.into());
            let mut buffer = plaintext.clone().into_bytes();
            let unpadded = buffer.len();
            buffer.resize(unpadded + 16, 0);
            let encrypted = cipher
                .encrypt_padded_mut::<Pkcs7>(&mut buffer, unpadded)
                .unwrap()
                .to_vec();
            let path = dir.path().join(format!("enc_{index}.ts"));
            std::fs::write(&path, encrypted).unwrap();
            urls.push(format!("file://{}", path.display()));
        }

        let rep = Representation {
            id: "video-0".into(),
            kind: TrackKind::Video,
            codec: "avc1".into(),
            bandwidth: 0,
            resolution: None,
            language: None,
            language_long: None,
            variant: TrackVariant::None,
            segments: SegmentPlan::Segments {
                init_url: None,
                urls,
                container: SegmentContainer::Ts,
                encryption: Some(SegmentEncryption {
                    method: EncryptionMethod::Aes128,
                    key_uri: Some(format!("file://{}/key.bin", dir.path().display())),
                    iv: None,
                    media_sequence,
                }),
            },
            encrypted: true,
            default_kid: None,
            pssh: Vec::new(),
            duration_s: 8.0,
        };
        let output = dir.path().join("out.ts");
        let (fetcher, _events) = fetcher(quick_download());
        fetcher
            .download_track("video", &rep, &output)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "TS-PAYLOAD-0TS-PAYLOAD-1"
        );
    }

    #[tokio::test]
    async fn single_file_path_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("movie.mp4");
        std::fs::write(&source, vec![7u8; 4096]).unwrap();
        let rep = Representation {
            id: "video-0".into(),
            kind: TrackKind::Video,
            codec: "avc1".into(),
            bandwidth: 0,
            resolution: None,
            language: None,
            language_long: None,
            variant: TrackVariant::None,
            segments: SegmentPlan::SingleFile {
                url: format!("file://{}", source.display()),
            },
            encrypted: false,
            default_kid: None,
            pssh: Vec::new(),
            duration_s: 120.0,
        };
        let output = dir.path().join("out.mp4");
        let (fetcher, _events) = fetcher(quick_download());
        let report = fetcher
            .download_track("video", &rep, &output)
            .await
            .unwrap();
        assert_eq!(report.bytes_written, 4096);
        assert_eq!(report.total_segments, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let rep = fixture_track(dir.path(), 50, &[]);
        let output = dir.path().join("out.ts");

        let cancel = CancelFlag::new();
        let (sink, receiver) = EventSink::channel(cancel.clone());
        let http = HttpClient::new(&NetworkSection::default()).unwrap();
        let fetcher = SegmentFetcher::new(http, HashMap::new(), quick_download(), sink);
        // Dropping the receiver makes the first emit flip the flag.
        drop(receiver);
        cancel.cancel();

        let result = fetcher.download_track("video", &rep, &output).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }

    #[test]
    fn retry_timing_follows_the_ramp() {
        assert_eq!(attempt_timeout(20, 0), Duration::from_secs(10));
        assert_eq!(attempt_timeout(20, 2), Duration::from_secs(16));
        assert_eq!(attempt_timeout(12, 5), Duration::from_secs(12));

        assert_eq!(backoff_delay(0), Duration::from_secs_f64(0.5));
        assert_eq!(backoff_delay(1), Duration::from_secs_f64(1.0));
        assert_eq!(backoff_delay(2), Duration::from_secs_f64(2.0));
        assert_eq!(backoff_delay(6), Duration::from_secs_f64(2.0));
    }

    #[test]
    fn fetch_state_accounting_is_disjoint() {
        let mut state = FetchState::new(10);
        state.downloaded.insert(0);
        state.downloaded.insert(1);
        state.failed.insert(2);
        assert!(state.downloaded.is_disjoint(&state.failed));
        assert!(state.downloaded.len() + state.failed.len() <= state.total);
    }
}
