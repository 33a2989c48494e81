#![allow(
    clippy::redundant_closure,
    clippy::let_and_return,
    clippy::needless_question_mark,
    clippy::result_large_err
)]

pub mod config;
pub mod downloader;
pub mod drm;
pub mod error;
pub mod event;
pub mod fetch;
pub mod http;
pub mod manifest;
pub mod mux;
pub mod progress;
pub mod select;
pub mod subtitle;

pub use config::{
    load_core_config, CoreConfig, DownloadSection, DrmSection, NetworkSection, OutputSection,
};
pub use downloader::{
    DownloadError, DownloadHandle, DownloadRequest, DownloadResult, Downloader, JobLog, JobPaths,
    JobReport,
};
pub use drm::{
    CdmKey, CdmKeyKind, CdmSession, ContentDecryptionModule, ContentKey, DrmError, DrmResult,
    DrmSystem, KeyResolver, LicenseEndpoint, PsshRecord,
};
pub use error::{ConfigError, Result};
pub use event::{CancelFlag, DownloadEvent, DownloadStatus, EventSink};
pub use fetch::{
    FetchError, FetchResult, FetchState, SegmentCipher, SegmentFetcher, TrackReport,
};
pub use http::{HttpClient, HttpError, HttpResponse, HttpResult};
pub use manifest::{
    LoadedManifest, ManifestError, ManifestKind, ManifestLoader, ManifestResult, Representation,
    SegmentContainer, SegmentEncryption, SegmentPlan, StreamSet, TrackKind, TrackVariant,
};
pub use mux::{
    CommandExecutor, MediaTrackFile, MuxController, MuxError, MuxOutcome, MuxPaths,
    SystemCommandExecutor,
};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use select::{
    select_tracks, DownloadPlan, ExternalSubtitle, ResolutionPolicy, SelectError,
    SelectionFallback, SelectionPolicy,
};
pub use subtitle::SubtitleFetcher;
