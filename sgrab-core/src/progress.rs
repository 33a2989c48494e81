use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

const SPEED_WINDOW: Duration = Duration::from_secs(2);
const EMIT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total_segments: usize,
    pub done: usize,
    pub failed: usize,
    pub percent: f64,
    pub bytes_done: u64,
    pub bytes_estimated_total: u64,
    pub speed_bps: u64,
    pub eta_s: Option<u64>,
}

struct TrackerState {
    segment_sizes: Vec<u64>,
    done: usize,
    failed: usize,
    bytes_done: u64,
    recent: VecDeque<(Instant, u64)>,
    last_emit: Option<Instant>,
}

/// Aggregates per-segment events into rate/ETA/percent figures. The
/// estimated total is the running mean segment size multiplied by the
/// segment count; speed comes from a short sliding window. A single
/// mutex guards the sample ring.
pub struct ProgressTracker {
    total_segments: usize,
    start: Instant,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(total_segments: usize) -> Self {
        Self {
            total_segments,
            start: Instant::now(),
            state: Mutex::new(TrackerState {
                segment_sizes: Vec::new(),
                done: 0,
                failed: 0,
                bytes_done: 0,
                recent: VecDeque::new(),
                last_emit: None,
            }),
        }
    }

    pub fn record_segment(&self, bytes: u64) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.done += 1;
        if bytes > 0 {
            state.segment_sizes.push(bytes);
        }
        state.bytes_done += bytes;
        state.recent.push_back((now, bytes));
        prune(&mut state.recent, now);
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.failed += 1;
    }

    /// Byte-based progress for the single-file path, where there is no
    /// segment count to advance.
    pub fn record_bytes(&self, bytes: u64) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.bytes_done += bytes;
        state.recent.push_back((now, bytes));
        prune(&mut state.recent, now);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        prune(&mut state.recent, now);

        let done = state.done;
        let failed = state.failed;
        let settled = done + failed;
        let percent = if self.total_segments > 0 {
            (settled as f64 / self.total_segments as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let mean_size = if state.segment_sizes.is_empty() {
            0.0
        } else {
            state.segment_sizes.iter().sum::<u64>() as f64 / state.segment_sizes.len() as f64
        };
        let bytes_estimated_total = (mean_size * self.total_segments as f64) as u64;

        let window_bytes: u64 = state.recent.iter().map(|(_, bytes)| bytes).sum();
        let window = now
            .duration_since(self.start)
            .min(SPEED_WINDOW)
            .as_secs_f64();
        let speed_bps = if window > 0.0 {
            (window_bytes as f64 / window) as u64
        } else {
            0
        };

        let eta_s = if settled > 0 && self.total_segments > settled {
            let elapsed = now.duration_since(self.start).as_secs_f64();
            let per_segment = elapsed / settled as f64;
            Some((per_segment * (self.total_segments - settled) as f64) as u64)
        } else {
            None
        };

        ProgressSnapshot {
            total_segments: self.total_segments,
            done,
            failed,
            percent,
            bytes_done: state.bytes_done,
            bytes_estimated_total,
            speed_bps,
            eta_s,
        }
    }

    /// Snapshot throttled to one emission per 100 ms; returns `None`
    /// inside the quiet interval.
    pub fn throttled_snapshot(&self) -> Option<ProgressSnapshot> {
        {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            if let Some(last) = state.last_emit {
                if now.duration_since(last) < EMIT_INTERVAL {
                    return None;
                }
            }
            state.last_emit = Some(now);
        }
        Some(self.snapshot())
    }
}

fn prune(recent: &mut VecDeque<(Instant, u64)>, now: Instant) {
    while let Some((stamp, _)) = recent.front() {
        if now.duration_since(*stamp) > SPEED_WINDOW {
            recent.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_total_from_mean_segment_size() {
        let tracker = ProgressTracker::new(10);
        tracker.record_segment(1000);
        tracker.record_segment(3000);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.done, 2);
        assert_eq!(snapshot.bytes_done, 4000);
        assert_eq!(snapshot.bytes_estimated_total, 20_000);
        assert!((snapshot.percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn failures_count_toward_percent() {
        let tracker = ProgressTracker::new(4);
        tracker.record_segment(100);
        tracker.record_failure();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert!((snapshot.percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_is_throttled() {
        let tracker = ProgressTracker::new(4);
        tracker.record_segment(100);
        assert!(tracker.throttled_snapshot().is_some());
        assert!(tracker.throttled_snapshot().is_none());
    }

    #[test]
    fn byte_progress_without_segments() {
        let tracker = ProgressTracker::new(0);
        tracker.record_bytes(4096);
        tracker.record_bytes(4096);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.bytes_done, 8192);
        assert_eq!(snapshot.done, 0);
        assert_eq!(snapshot.eta_s, None);
    }

    #[test]
    fn eta_present_when_work_remains() {
        let tracker = ProgressTracker::new(100);
        tracker.record_segment(100);
        let snapshot = tracker.snapshot();
        assert!(snapshot.eta_s.is_some());
    }
}
