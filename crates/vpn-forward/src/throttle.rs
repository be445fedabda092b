//! Per-direction bandwidth limiting
//!
//! Bytes are accounted against a fixed 100 ms window. Once a window's budget
//! is used up the caller sleeps until the next window starts.

use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct Throttle {
    /// Bytes per window, 0 = unlimited
    budget: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl Throttle {
    /// `bytes_per_sec == 0` disables throttling
    pub fn new(bytes_per_sec: u64) -> Self {
        let budget = if bytes_per_sec == 0 {
            0
        } else {
            (bytes_per_sec / 10).max(1)
        };
        Self {
            budget,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.budget == 0
    }

    /// Largest read that keeps a single chunk within one window's budget
    pub fn chunk_limit(&self, buffer_len: usize) -> usize {
        if self.is_unlimited() {
            buffer_len
        } else {
            buffer_len.min(self.budget as usize).max(1)
        }
    }

    /// How long the caller must wait after moving `n` more bytes
    pub fn record(&mut self, n: u64) -> Option<Duration> {
        if self.is_unlimited() {
            return None;
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.window_bytes = 0;
        }

        self.window_bytes += n;
        if self.window_bytes < self.budget {
            return None;
        }

        let wait = WINDOW.saturating_sub(now.duration_since(self.window_start));
        self.window_start = now + wait;
        self.window_bytes = 0;
        Some(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let mut throttle = Throttle::new(0);
        assert!(throttle.is_unlimited());
        assert_eq!(throttle.chunk_limit(65536), 65536);
        assert_eq!(throttle.record(u64::MAX / 2), None);
    }

    #[test]
    fn test_budget_exhaustion_requests_wait() {
        // 10 KiB/s means 1024 bytes per 100 ms window
        let mut throttle = Throttle::new(10 * 1024);
        assert_eq!(throttle.chunk_limit(65536), 1024);
        assert_eq!(throttle.record(512), None);

        let wait = throttle.record(512).expect("budget should be exhausted");
        assert!(wait <= WINDOW);
    }

    #[tokio::test]
    async fn test_rate_is_roughly_respected() {
        let mut throttle = Throttle::new(100 * 1024);
        let started = Instant::now();
        let mut moved = 0u64;
        while moved < 50 * 1024 {
            let n = throttle.chunk_limit(65536) as u64;
            moved += n;
            if let Some(wait) = throttle.record(n) {
                tokio::time::sleep(wait).await;
            }
        }
        // 50 KiB at 100 KiB/s takes about half a second
        assert!(started.elapsed() >= Duration::from_millis(350));
    }
}
