mod error;
mod types;

use std::sync::Arc;

use tokio::fs;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

pub use error::{DownloadError, DownloadResult};
pub use types::{DownloadRequest, JobLog, JobPaths, JobReport};

use crate::config::CoreConfig;
use crate::drm::{ContentDecryptionModule, ContentKey, KeyResolver, LicenseEndpoint};
use crate::event::{CancelFlag, DownloadEvent, DownloadStatus, EventSink};
use crate::fetch::{FetchError, SegmentFetcher, TrackReport};
use crate::http::HttpClient;
use crate::manifest::{
    LoadedManifest, ManifestError, ManifestLoader, Representation, SegmentContainer, SegmentPlan,
    TrackKind,
};
use crate::mux::{CommandExecutor, MediaTrackFile, MuxController, MuxOutcome, MuxPaths};
use crate::select::{select_tracks, DownloadPlan};
use crate::subtitle::SubtitleFetcher;

/// Top-level state machine driving one download job:
/// `NotStarted → Parsing → Downloading → {Completed | Failed | Cancelled}`.
///
/// The job is exposed as a lazy event sequence: the caller pulls
/// [`DownloadEvent`]s from the handle, and dropping the receiver cancels
/// the producer at its next emission.
#[derive(Clone)]
pub struct Downloader {
    config: CoreConfig,
    http: HttpClient,
    mux: MuxController,
    cdms: Vec<Arc<dyn ContentDecryptionModule>>,
}

pub struct DownloadHandle {
    events: tokio::sync::mpsc::UnboundedReceiver<DownloadEvent>,
    cancel: CancelFlag,
    join: JoinHandle<JobReport>,
}

impl DownloadHandle {
    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Split into a `Stream` of events plus the pieces needed to cancel
    /// and join, for `StreamExt`-style consumers.
    pub fn split(
        self,
    ) -> (
        UnboundedReceiverStream<DownloadEvent>,
        CancelFlag,
        JoinHandle<JobReport>,
    ) {
        (
            UnboundedReceiverStream::new(self.events),
            self.cancel,
            self.join,
        )
    }

    /// Drain remaining events and wait for the final report. Events must
    /// keep flowing while waiting, otherwise the drop-to-cancel contract
    /// would fire on a consumer that merely stopped looking.
    pub async fn wait(self) -> JobReport {
        let DownloadHandle {
            mut events,
            cancel: _,
            join,
        } = self;
        let drain = async move { while events.recv().await.is_some() {} };
        let (joined, _) = tokio::join!(join, drain);
        joined.unwrap_or_else(|err| {
            let mut report = JobReport::new(Default::default(), DownloadStatus::Failed);
            report.error = Some(format!("job task failed: {err}"));
            report
        })
    }
}

impl Downloader {
    pub fn new(config: CoreConfig) -> DownloadResult<Self> {
        let http = HttpClient::new(&config.network)?;
        Ok(Self {
            config,
            http,
            mux: MuxController::new(MuxPaths::default(), None),
            cdms: Vec::new(),
        })
    }

    pub fn with_mux_paths(mut self, paths: MuxPaths) -> Self {
        self.mux = MuxController::new(paths, None);
        self
    }

    pub fn with_command_executor(
        mut self,
        paths: MuxPaths,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        self.mux = MuxController::new(paths, Some(executor));
        self
    }

    pub fn with_cdm(mut self, cdm: Arc<dyn ContentDecryptionModule>) -> Self {
        self.cdms.push(cdm);
        self
    }

    /// Spawn the job and hand back the event stream.
    pub fn start(&self, request: DownloadRequest) -> DownloadHandle {
        let cancel = CancelFlag::new();
        let (sink, events) = EventSink::channel(cancel.clone());
        let downloader = self.clone();
        let join = tokio::spawn(async move { downloader.run(request, sink).await });
        DownloadHandle {
            events,
            cancel,
            join,
        }
    }

    /// Run to completion, discarding intermediate events.
    pub async fn download(&self, request: DownloadRequest) -> JobReport {
        self.start(request).wait().await
    }

    /// The full job. Never panics outward; every failure mode lands in
    /// the returned report and as a terminal event.
    pub async fn run(&self, request: DownloadRequest, sink: EventSink) -> JobReport {
        let cancel = sink.cancel_flag().clone();
        let output_path = request.output_path.clone();
        match self.run_inner(&request, &sink, &cancel).await {
            Ok(report) => {
                sink.emit(DownloadEvent::Completed {
                    output: report.output_path.clone(),
                });
                report
            }
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                sink.emit(DownloadEvent::StatusChanged {
                    status: DownloadStatus::Cancelled,
                });
                sink.emit(DownloadEvent::Cancelled);
                if self.config.output.cleanup_temp {
                    let paths = JobPaths::new(&output_path);
                    if let Err(err) = fs::remove_dir_all(&paths.root).await {
                        warn!(error = %err, "failed to remove job directory after cancel");
                    }
                }
                let mut report = JobReport::new(output_path, DownloadStatus::Cancelled);
                report.error = Some("cancelled".to_string());
                report
            }
            Err(err) => {
                sink.emit(DownloadEvent::StatusChanged {
                    status: DownloadStatus::Failed,
                });
                sink.emit(DownloadEvent::Failed {
                    error: err.to_string(),
                });
                let mut report = JobReport::new(output_path, DownloadStatus::Failed);
                report.exit_code = err.exit_code();
                report.error = Some(err.to_string());
                report
            }
        }
    }

    async fn run_inner(
        &self,
        request: &DownloadRequest,
        sink: &EventSink,
        cancel: &CancelFlag,
    ) -> DownloadResult<JobReport> {
        let paths = JobPaths::new(&request.output_path);

        // Re-running against an existing artifact is a no-op.
        if let Ok(meta) = fs::metadata(&request.output_path).await {
            if meta.is_file() && meta.len() > 0 {
                info!(path = %request.output_path.display(), "output already exists, skipping download");
                sink.emit(DownloadEvent::StatusChanged {
                    status: DownloadStatus::Completed,
                });
                let mut report =
                    JobReport::new(request.output_path.clone(), DownloadStatus::Completed);
                report.bytes_total = meta.len();
                return Ok(report);
            }
        }

        fs::create_dir_all(&paths.root)
            .await
            .map_err(|source| DownloadError::Io {
                path: paths.root.clone(),
                source,
            })?;
        fs::write(paths.ignore_marker(), b"")
            .await
            .map_err(|source| DownloadError::Io {
                path: paths.ignore_marker(),
                source,
            })?;
        let log = JobLog::new(paths.log());
        let job_id = Uuid::new_v4();
        log.line(
            "INFO",
            &format!("job {job_id} started: {}", request.manifest_url),
        );

        sink.emit(DownloadEvent::StatusChanged {
            status: DownloadStatus::Parsing,
        });

        let loader = ManifestLoader::new(self.http.clone());
        // First pass honors a pre-extracted raw manifest; a 404-looking
        // failure during download flips the whole job to the origin URL
        // once and restarts the download phase.
        let mut from_raw = request.raw_manifest.is_some();
        let (tracks, keys) = loop {
            let loaded = self.load_manifest(&loader, request, from_raw, &paths, &log).await?;
            sink.emit(DownloadEvent::ManifestParsed {
                kind: loaded.stream_set.kind,
                video_tracks: loaded.stream_set.of_kind(TrackKind::Video).count(),
                audio_tracks: loaded.stream_set.of_kind(TrackKind::Audio).count(),
                subtitle_tracks: loaded.stream_set.of_kind(TrackKind::Subtitle).count(),
            });

            let keys = self.resolve_keys(&loaded, request, sink, &log).await?;

            let (plan, fallbacks) = select_tracks(
                &loaded.stream_set,
                &request.selection,
                &request.external_subtitles,
            )?;
            for fallback in fallbacks {
                log.line(
                    "WARN",
                    &format!("no {:?} track matched, selected {}", fallback.kind, fallback.selected),
                );
                sink.emit(DownloadEvent::Fallback {
                    kind: fallback.kind,
                    selected: fallback.selected,
                });
            }
            sink.emit(DownloadEvent::TracksSelected {
                video: plan.video.id.clone(),
                audio: plan.audio.iter().map(|rep| rep.id.clone()).collect(),
                subtitles: plan.subtitles.iter().map(|rep| rep.id.clone()).collect(),
            });

            sink.emit(DownloadEvent::StatusChanged {
                status: DownloadStatus::Downloading,
            });
            match self.download_tracks(request, &plan, &paths, sink, cancel).await {
                Ok(tracks) => break (tracks, keys),
                Err(err) if from_raw && looks_like_stale_manifest(&err) => {
                    log.line("WARN", "404 during download, switching to origin URL");
                    sink.emit(DownloadEvent::Warning {
                        message: "404 detected, refetching manifest from origin".to_string(),
                    });
                    from_raw = false;
                    continue;
                }
                Err(err) => {
                    log.line("ERROR", &err.to_string());
                    return Err(err);
                }
            }
        };
        self.ensure_live(cancel)?;

        let DownloadedTracks {
            video,
            video_encrypted,
            audio,
            subtitles,
            mut reports,
        } = tracks;

        // CENC tracks were written encrypted; decrypt them in place
        // before the mux stage.
        let video_path = if video_encrypted {
            self.decrypt_track(&keys, &video.output_path, &log).await?
        } else {
            video.output_path.clone()
        };
        let mut audio_files = Vec::new();
        for (report, encrypted) in &audio {
            let path = if *encrypted {
                self.decrypt_track(&keys, &report.output_path, &log).await?
            } else {
                report.output_path.clone()
            };
            audio_files.push(MediaTrackFile {
                path,
                language: report.track.clone(),
            });
        }
        self.ensure_live(cancel)?;

        // Sidecar subtitles ride along with the manifest ones.
        let subtitle_fetcher = SubtitleFetcher::new(self.http.clone(), request.headers.clone());
        let mut subtitle_files = subtitles;
        subtitle_files.extend(
            subtitle_fetcher
                .download_all(&request.external_subtitles, &paths.root, &paths.name)
                .await,
        );

        sink.emit(DownloadEvent::MuxStarted {
            stage: "mux".to_string(),
        });
        log.line("INFO", "muxing final artifact");
        let mux_subtitles = if self.config.output.merge_subtitles {
            subtitle_files.clone()
        } else {
            Vec::new()
        };
        let outcome: MuxOutcome = self
            .mux
            .mux(
                &video_path,
                &audio_files,
                &mux_subtitles,
                &paths.mux_output(&self.config.output.extension),
            )
            .await?;
        self.ensure_live(cancel)?;

        move_into_place(&outcome.final_path, &request.output_path).await?;
        sink.emit(DownloadEvent::MuxDone {
            output: request.output_path.clone(),
        });

        // Unmerged subtitles are kept next to the artifact.
        if !self.config.output.merge_subtitles {
            for subtitle in &subtitle_files {
                if let Some(file_name) = subtitle.path.file_name() {
                    let target = paths.output_dir.join(file_name);
                    if let Err(err) = fs::rename(&subtitle.path, &target).await {
                        warn!(error = %err, "failed to move subtitle next to output");
                    }
                }
            }
        }

        let bytes_total = fs::metadata(&request.output_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        if self.config.output.cleanup_temp {
            if let Err(err) = fs::remove_dir_all(&paths.root).await {
                warn!(path = %paths.root.display(), error = %err, "failed to clean job directory");
            }
        } else {
            let _ = fs::remove_file(paths.ignore_marker()).await;
        }

        sink.emit(DownloadEvent::StatusChanged {
            status: DownloadStatus::Completed,
        });
        let mut report = JobReport::new(request.output_path.clone(), DownloadStatus::Completed);
        report.duration_s = outcome.duration_s.or_else(|| {
            let duration = video.duration_s;
            (duration > 0.0).then_some(duration)
        });
        report.bytes_total = bytes_total;
        reports.insert(0, video);
        report.tracks = reports;
        info!(
            path = %report.output_path.display(),
            bytes = report.bytes_total,
            "download completed"
        );
        Ok(report)
    }

    async fn load_manifest(
        &self,
        loader: &ManifestLoader,
        request: &DownloadRequest,
        from_raw: bool,
        paths: &JobPaths,
        log: &JobLog,
    ) -> DownloadResult<LoadedManifest> {
        let loaded = if let (true, Some(raw)) = (from_raw, request.raw_manifest.as_deref()) {
            let base = extract_base_url(&request.manifest_url);
            log.line("INFO", &format!("using raw manifest with base url {base}"));
            loader
                .load_from_text(raw, &base, &request.headers)
                .await?
        } else {
            log.line("INFO", &format!("fetching manifest from {}", request.manifest_url));
            loader.load(&request.manifest_url, &request.headers).await?
        };

        fs::write(paths.raw_manifest(loaded.stream_set.kind), &loaded.raw)
            .await
            .map_err(|source| DownloadError::Io {
                path: paths.raw_manifest(loaded.stream_set.kind),
                source,
            })?;
        let meta = loaded
            .stream_set
            .to_json()
            .map_err(DownloadError::Manifest)?;
        fs::write(paths.meta(), meta)
            .await
            .map_err(|source| DownloadError::Io {
                path: paths.meta(),
                source,
            })?;
        Ok(loaded)
    }

    async fn resolve_keys(
        &self,
        loaded: &LoadedManifest,
        request: &DownloadRequest,
        sink: &EventSink,
        log: &JobLog,
    ) -> DownloadResult<Vec<ContentKey>> {
        let needs_drm = loaded
            .stream_set
            .representations
            .iter()
            .any(Representation::needs_drm);
        if !needs_drm {
            return Ok(Vec::new());
        }

        if let Some(raw_key) = request.raw_key.as_deref() {
            let keys = KeyResolver::resolve_raw(raw_key)?;
            log.line("INFO", "using caller-supplied content key");
            sink.emit(DownloadEvent::KeysResolved { count: keys.len() });
            return Ok(keys);
        }

        let records = loaded.stream_set.pssh_records();
        if records.is_empty() {
            return Err(DownloadError::DrmUnsupported);
        }
        let Some(license_url) = request.license_url.as_deref() else {
            return Err(DownloadError::DrmUnsupported);
        };
        if self.cdms.is_empty() {
            return Err(DownloadError::DrmUnsupported);
        }

        let mut endpoint = LicenseEndpoint::new(license_url);
        endpoint.headers = request.license_headers.clone();
        endpoint.query_params = request.license_query_params.clone();

        let resolver = KeyResolver::new(self.http.clone(), &self.config.drm);
        let keys = resolver.resolve(&records, &endpoint, &self.cdms).await?;
        log.line("INFO", &format!("obtained {} content key(s)", keys.len()));
        sink.emit(DownloadEvent::KeysResolved { count: keys.len() });
        Ok(keys)
    }

    async fn download_tracks(
        &self,
        request: &DownloadRequest,
        plan: &DownloadPlan,
        paths: &JobPaths,
        sink: &EventSink,
        cancel: &CancelFlag,
    ) -> DownloadResult<DownloadedTracks> {
        let fetcher = SegmentFetcher::new(
            self.http.clone(),
            request.headers.clone(),
            self.config.download.clone(),
            sink.clone(),
        );

        let video_path = paths.video(container_extension(&plan.video));
        let video_future = fetcher.download_track("video", &plan.video, &video_path);

        let audio_targets: Vec<(String, std::path::PathBuf, &Representation)> = plan
            .audio
            .iter()
            .map(|rep| {
                let language = rep
                    .language
                    .clone()
                    .unwrap_or_else(|| rep.id.clone());
                let path = paths.audio(&language);
                (language, path, rep)
            })
            .collect();

        let audio_futures = async {
            let mut results = Vec::new();
            for (language, path, rep) in &audio_targets {
                results.push((
                    language.clone(),
                    fetcher.download_track(language, rep, path).await,
                    rep.needs_drm(),
                ));
            }
            results
        };

        // The video track is mandatory; audio failures degrade to a
        // warning and the track is dropped from the mux.
        let (video_result, audio_results) = if self.config.download.concurrent_download {
            tokio::join!(video_future, audio_futures)
        } else {
            let video_result = video_future.await;
            let audio_results = audio_futures.await;
            (video_result, audio_results)
        };
        let video = video_result?;

        let mut audio = Vec::new();
        let mut reports = Vec::new();
        for (language, result, encrypted) in audio_results {
            match result {
                Ok(report) => {
                    reports.push(report.clone());
                    audio.push((report, encrypted));
                }
                Err(FetchError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(err) => {
                    warn!(language = %language, error = %err, "audio track failed, continuing without it");
                    sink.emit(DownloadEvent::Warning {
                        message: format!("audio track {language} failed: {err}"),
                    });
                }
            }
        }
        self.ensure_live(cancel)?;

        let mut subtitles = Vec::new();
        for rep in &plan.subtitles {
            let language = rep.language.clone().unwrap_or_else(|| rep.id.clone());
            let path = paths.subtitle(&language, "vtt");
            match fetcher.download_track(&language, rep, &path).await {
                Ok(report) => {
                    reports.push(report);
                    subtitles.push(MediaTrackFile {
                        path,
                        language,
                    });
                }
                Err(FetchError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(err) => {
                    warn!(language = %language, error = %err, "subtitle track failed, continuing without it");
                    sink.emit(DownloadEvent::Warning {
                        message: format!("subtitle track {language} failed: {err}"),
                    });
                }
            }
        }

        Ok(DownloadedTracks {
            video,
            video_encrypted: plan.video.needs_drm(),
            audio,
            subtitles,
            reports,
        })
    }

    async fn decrypt_track(
        &self,
        keys: &[ContentKey],
        input: &std::path::Path,
        log: &JobLog,
    ) -> DownloadResult<std::path::PathBuf> {
        if keys.is_empty() {
            return Err(DownloadError::DrmUnsupported);
        }
        let decrypted = input.with_extension("dec.mp4");
        self.mux.decrypt_cenc(keys, input, &decrypted).await?;
        log.line("INFO", &format!("decrypted {}", input.display()));
        Ok(decrypted)
    }

    fn ensure_live(&self, cancel: &CancelFlag) -> DownloadResult<()> {
        if cancel.is_cancelled() {
            Err(DownloadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

struct DownloadedTracks {
    video: TrackReport,
    video_encrypted: bool,
    /// Audio reports plus whether each payload still carries CENC.
    audio: Vec<(TrackReport, bool)>,
    subtitles: Vec<MediaTrackFile>,
    reports: Vec<TrackReport>,
}

fn container_extension(representation: &Representation) -> &'static str {
    match &representation.segments {
        SegmentPlan::SingleFile { .. } => "mp4",
        SegmentPlan::Segments { container, .. } => match container {
            SegmentContainer::Ts => "ts",
            SegmentContainer::Aac => "aac",
            SegmentContainer::Mp4 | SegmentContainer::M4s => "mp4",
        },
    }
}

/// Strip the manifest filename, keeping everything else (query included):
/// the base-url override handed to the raw-manifest download path.
fn extract_base_url(url: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else {
        return match url.rsplit_once('/') {
            Some((base, _)) => format!("{base}/"),
            None => url.to_string(),
        };
    };
    let path = parsed.path().to_string();
    let mut parts: Vec<&str> = path.split('/').collect();
    if let Some(last) = parts.last() {
        let lowered = last.to_ascii_lowercase();
        if lowered.contains(".m3u8") || lowered.contains(".mpd") {
            parts.pop();
        }
    }
    let mut new_path = parts.join("/");
    if !new_path.ends_with('/') {
        new_path.push('/');
    }
    parsed.set_path(&new_path);
    parsed.to_string()
}

fn looks_like_stale_manifest(err: &DownloadError) -> bool {
    match err {
        DownloadError::Fetch(FetchError::TrackIncomplete { .. }) => true,
        DownloadError::Fetch(FetchError::Init { reason }) => reason.contains("404"),
        DownloadError::Manifest(ManifestError::FetchStatus { status: 404, .. }) => true,
        _ => false,
    }
}

async fn move_into_place(
    from: &std::path::Path,
    to: &std::path::Path,
) -> DownloadResult<()> {
    if from == to {
        return Ok(());
    }
    if fs::metadata(to).await.is_ok() {
        let _ = fs::remove_file(to).await;
    }
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems; fall back to copy + delete.
    fs::copy(from, to)
        .await
        .map_err(|source| DownloadError::Io {
            path: to.to_path_buf(),
            source,
        })?;
    let _ = fs::remove_file(from).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_extraction() {
        assert_eq!(
            extract_base_url("https://cdn.example/a/b/play.m3u8?token=1"),
            "https://cdn.example/a/b/?token=1"
        );
        assert_eq!(
            extract_base_url("https://cdn.example/a/b/manifest.mpd"),
            "https://cdn.example/a/b/"
        );
        assert_eq!(
            extract_base_url("https://cdn.example/a/b/"),
            "https://cdn.example/a/b/"
        );
    }

    #[test]
    fn stale_manifest_detection() {
        assert!(looks_like_stale_manifest(&DownloadError::Fetch(
            FetchError::TrackIncomplete {
                failed: 40,
                total: 40
            }
        )));
        assert!(looks_like_stale_manifest(&DownloadError::Fetch(
            FetchError::Init {
                reason: "http 404".into()
            }
        )));
        assert!(!looks_like_stale_manifest(&DownloadError::Cancelled));
    }
}
