//! Per-rule traffic counters
//!
//! A [`StatsCounter`] is created for every run of a rule and shared by all of
//! that run's relay tasks. Updates are plain atomics; once the run is stopped
//! the counter is frozen and further updates are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Traffic direction relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target
    Upload,
    /// Target to client
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

#[derive(Debug)]
pub struct StatsCounter {
    live: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    failed_connections: AtomicU64,
    rejected_connections: AtomicU64,
    upload_speed: AtomicU64,
    download_speed: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Default for StatsCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCounter {
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            failed_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            upload_speed: AtomicU64::new(0),
            download_speed: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop accepting updates; called before the owning run is torn down
    pub fn freeze(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Zero the gauges once every relay task of the run has exited
    pub fn finish(&self) {
        self.freeze();
        self.active_connections.store(0, Ordering::Release);
        self.upload_speed.store(0, Ordering::Release);
        self.download_speed.store(0, Ordering::Release);
    }

    pub fn add_bytes(&self, direction: Direction, n: u64) {
        if !self.is_live() {
            return;
        }
        match direction {
            Direction::Upload => self.bytes_in.fetch_add(n, Ordering::Relaxed),
            Direction::Download => self.bytes_out.fetch_add(n, Ordering::Relaxed),
        };
    }

    pub fn connection_opened(&self) {
        if !self.is_live() {
            return;
        }
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn connection_failed(&self) {
        if self.is_live() {
            self.failed_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_rejected(&self) {
        if self.is_live() {
            self.rejected_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    pub fn set_speeds(&self, upload: u64, download: u64) {
        if !self.is_live() {
            return;
        }
        self.upload_speed.store(upload, Ordering::Relaxed);
        self.download_speed.store(download, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let live = self.is_live();
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Acquire),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            upload_speed: self.upload_speed.load(Ordering::Relaxed),
            download_speed: self.download_speed.load(Ordering::Relaxed),
            started_at: live.then_some(self.started_at),
            uptime: if live { self.started.elapsed().as_secs() } else { 0 },
        }
    }
}

/// Point-in-time copy of a [`StatsCounter`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Client to target bytes
    pub bytes_in: u64,
    /// Target to client bytes
    pub bytes_out: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub rejected_connections: u64,
    /// Bytes per second, sampled
    pub upload_speed: u64,
    pub download_speed: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds since the run started
    pub uptime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_while_live() {
        let stats = StatsCounter::new();
        stats.connection_opened();
        stats.add_bytes(Direction::Upload, 10);
        stats.add_bytes(Direction::Download, 32);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_in, 10);
        assert_eq!(snap.bytes_out, 32);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.total_connections, 1);
        assert!(snap.started_at.is_some());

        stats.connection_closed();
        assert_eq!(stats.active_connections(), 0);
    }

    #[test]
    fn test_frozen_counter_ignores_updates() {
        let stats = StatsCounter::new();
        stats.connection_opened();
        stats.finish();

        stats.add_bytes(Direction::Upload, 100);
        stats.connection_opened();
        stats.connection_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_in, 0);
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.total_connections, 1);
        assert_eq!(snap.failed_connections, 0);
        assert_eq!(snap.uptime, 0);
    }

    #[test]
    fn test_close_never_underflows() {
        let stats = StatsCounter::new();
        stats.connection_closed();
        assert_eq!(stats.active_connections(), 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(StatsCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.add_bytes(Direction::Upload, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.bytes().0, 8000);
    }
}
