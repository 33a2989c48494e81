use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::manifest::{ManifestKind, TrackKind};
use crate::progress::ProgressSnapshot;

/// Overall job state. Monotone except for the terminal back-edges out of
/// `Downloading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    NotStarted,
    Parsing,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

/// Everything the engine reports while a job runs. The caller consumes
/// these lazily; dropping the receiver cancels the job.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    StatusChanged {
        status: DownloadStatus,
    },
    ManifestParsed {
        kind: ManifestKind,
        video_tracks: usize,
        audio_tracks: usize,
        subtitle_tracks: usize,
    },
    TracksSelected {
        video: String,
        audio: Vec<String>,
        subtitles: Vec<String>,
    },
    Fallback {
        kind: TrackKind,
        selected: String,
    },
    KeysResolved {
        count: usize,
    },
    TrackStarted {
        track: String,
        kind: TrackKind,
        segments: usize,
    },
    SegmentDone {
        track: String,
        index: usize,
        bytes: u64,
        attempts: u32,
    },
    SegmentFailed {
        track: String,
        index: usize,
        last_status: Option<u16>,
    },
    Progress {
        track: String,
        snapshot: ProgressSnapshot,
    },
    TrackDone {
        track: String,
        bytes_total: u64,
        failed: usize,
    },
    TrackFailed {
        track: String,
        reason: String,
    },
    MuxStarted {
        stage: String,
    },
    MuxDone {
        output: PathBuf,
    },
    Warning {
        message: String,
    },
    Completed {
        output: PathBuf,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

/// Shared cancellation flag, observed at await points. Idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set. Polled, so only suitable as the
    /// slow arm of a `select!`.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

/// Event channel handle given to producers. A send failure means the
/// consumer went away, which flips the cancel flag: stopping to pull
/// events is how a caller cancels the job.
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<DownloadEvent>,
    cancel: CancelFlag,
}

impl EventSink {
    pub fn new(sender: mpsc::UnboundedSender<DownloadEvent>, cancel: CancelFlag) -> Self {
        Self { sender, cancel }
    }

    pub fn channel(cancel: CancelFlag) -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender, cancel), receiver)
    }

    pub fn emit(&self, event: DownloadEvent) {
        if self.sender.send(event).is_err() {
            self.cancel.cancel();
        }
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_receiver_cancels() {
        let cancel = CancelFlag::new();
        let (sink, receiver) = EventSink::channel(cancel.clone());
        sink.emit(DownloadEvent::Cancelled);
        assert!(!cancel.is_cancelled());
        drop(receiver);
        sink.emit(DownloadEvent::Cancelled);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        cancel.cancel();
        assert!(cancel.is_cancelled());
    }
}
