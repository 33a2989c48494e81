use std::path::PathBuf;

use thiserror::Error;

use crate::drm::DrmError;
use crate::fetch::FetchError;
use crate::http::HttpError;
use crate::manifest::ManifestError;
use crate::mux::MuxError;
use crate::select::SelectError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Drm(#[from] DrmError),
    #[error("content is DRM-protected but no license url, key or CDM was provided")]
    DrmUnsupported,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DownloadError::Cancelled | DownloadError::Fetch(FetchError::Cancelled)
        )
    }

    /// Process exit code mapping: 1 transient, 2 permanent (manifest or
    /// DRM), 3 cancelled.
    pub fn exit_code(&self) -> i32 {
        if self.is_cancelled() {
            return 3;
        }
        match self {
            DownloadError::Manifest(_)
            | DownloadError::Drm(_)
            | DownloadError::DrmUnsupported
            | DownloadError::Select(_) => 2,
            _ => 1,
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(
            DownloadError::Manifest(ManifestError::invalid("broken")).exit_code(),
            2
        );
        assert_eq!(DownloadError::DrmUnsupported.exit_code(), 2);
        assert_eq!(DownloadError::Cancelled.exit_code(), 3);
        assert_eq!(
            DownloadError::Fetch(FetchError::Cancelled).exit_code(),
            3
        );
        assert_eq!(
            DownloadError::Fetch(FetchError::TrackIncomplete {
                failed: 50,
                total: 60
            })
            .exit_code(),
            1
        );
    }
}
