//! Transfer tuning: chunk sizing under a rate limit, append offsets and
//! the throttle used by the streaming loops in `file_ops`.

use crate::ftp::types::RemoteExists;
use tokio::time::{Duration, Instant};

pub const DEFAULT_CHUNK_SIZE: usize = 65_536;
pub const MIN_CHUNK_SIZE: usize = 64;
/// Window within which one chunk should go out under a rate limit.
pub const RATE_CONTROL_RESOLUTION_MS: u64 = 100;

/// Chunk size to use for a transfer.
///
/// A customised chunk size is returned unchanged. The default size is halved
/// while sending one chunk at `rate_limit_bytes` per second would take longer
/// than `resolution_ms`, stopping at [`MIN_CHUNK_SIZE`].
pub fn compute_chunk_size(configured: usize, rate_limit_bytes: u64, resolution_ms: u64) -> usize {
    let mut chunk = configured;
    if chunk != DEFAULT_CHUNK_SIZE || rate_limit_bytes == 0 {
        return chunk;
    }
    while chunk > MIN_CHUNK_SIZE && 1000 * chunk as u64 / rate_limit_bytes > resolution_ms {
        chunk /= 2;
    }
    chunk.max(MIN_CHUNK_SIZE)
}

/// Local read offset for an append-style upload.
///
/// Resuming continues the local file where the remote one ends; adding to
/// the end sends the whole local file.
pub fn compute_append_offset(mode: RemoteExists, remote_position: u64) -> u64 {
    if mode.is_resume() {
        remote_position
    } else {
        0
    }
}

/// Sleeps a transfer loop down to a byte rate.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    resolution: Duration,
    window_start: Instant,
    window_bytes: u64,
}

impl RateLimiter {
    /// `kib_per_sec` of 0 disables throttling.
    pub fn new(kib_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: kib_per_sec * 1024,
            resolution: Duration::from_millis(RATE_CONTROL_RESOLUTION_MS),
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    pub fn is_enabled(&self) -> bool {
        self.bytes_per_sec > 0
    }

    /// Account for `bytes` just transferred and sleep if ahead of the limit.
    pub async fn throttle(&mut self, bytes: usize) {
        if !self.is_enabled() {
            return;
        }
        self.window_bytes += bytes as u64;
        if let Some(delay) = self.pending_delay(self.window_start.elapsed()) {
            tokio::time::sleep(delay).await;
        }
    }

    /// How long to wait given the time spent in the current window. Falling
    /// more than one resolution behind starts a new window.
    fn pending_delay(&mut self, elapsed: Duration) -> Option<Duration> {
        let should_take = Duration::from_millis(self.window_bytes * 1000 / self.bytes_per_sec);
        if should_take > elapsed {
            Some(should_take - elapsed)
        } else {
            if elapsed > should_take + self.resolution {
                self.window_bytes = 0;
                self.window_start = Instant::now();
            }
            None
        }
    }
}
