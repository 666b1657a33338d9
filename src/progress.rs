//! Transfer progress and speed tracking.
//!
//! The tracker is fed byte-count deltas at each receipt-notification batch
//! and derives percent-in-part plus two throughput figures: instantaneous
//! speed over the latest sampling window and average speed over the whole
//! transfer. It never blocks and performs no I/O; callers supply the
//! timestamps.

use std::time::Instant;

use serde::Serialize;

/// One progress sample, produced per receipt-notification batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSample {
    /// Current part number (1-based).
    pub part: usize,
    /// Total parts in the package.
    pub total_parts: usize,
    /// Percent of the current part's image transferred (0-100).
    pub percent: u8,
    /// Throughput over the latest sampling window, bytes per second.
    pub speed_bps: f64,
    /// Throughput since the transfer started, bytes per second.
    pub avg_speed_bps: f64,
}

/// Accumulates byte counts across parts and turns them into samples.
#[derive(Debug)]
pub struct ProgressTracker {
    total_parts: usize,
    part: usize,
    part_size: usize,
    part_bytes: usize,
    total_bytes: u64,
    started_at: Option<Instant>,
    last_sample_at: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(total_parts: usize) -> Self {
        Self {
            total_parts,
            part: 0,
            part_size: 0,
            part_bytes: 0,
            total_bytes: 0,
            started_at: None,
            last_sample_at: None,
        }
    }

    /// Begin tracking a new part. Cumulative totals carry across parts;
    /// the percent counter resets.
    pub fn start_part(&mut self, part: usize, part_size: usize, now: Instant) {
        self.part = part;
        self.part_size = part_size;
        self.part_bytes = 0;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.last_sample_at = Some(now);
    }

    /// Record `bytes` transferred since the previous sample and produce a
    /// sample for it.
    pub fn record(&mut self, bytes: usize, now: Instant) -> ProgressSample {
        self.part_bytes = (self.part_bytes + bytes).min(self.part_size);
        self.total_bytes += bytes as u64;

        let window = self
            .last_sample_at
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        let total = self
            .started_at
            .map(|start| now.duration_since(start).as_secs_f64())
            .unwrap_or(0.0);
        self.last_sample_at = Some(now);

        let percent = if self.part_size == 0 {
            100
        } else {
            ((self.part_bytes * 100) / self.part_size) as u8
        };

        ProgressSample {
            part: self.part,
            total_parts: self.total_parts,
            percent,
            speed_bps: rate(bytes as f64, window),
            avg_speed_bps: rate(self.total_bytes as f64, total),
        }
    }
}

/// Bytes over seconds, with a zero-duration guard.
fn rate(bytes: f64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bytes / seconds
    } else {
        0.0
    }
}
