//! Shared operation status
//!
//! The one structure both sides touch: the worker writes counters and
//! meter samples, the UI polls snapshots on a timer. Everything lives
//! behind a single mutex per operation; critical sections only move
//! integers around, never perform I/O.

use crate::limiter::{BurstPlan, SpeedLimit, SpeedLimiter};
use crate::speed::{SpeedMeter, PROGRESS_METER, TRANSFER_METER};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// What the UI reads on each poll
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    /// Bytes actually moved so far
    pub transferred: u64,
    /// Exact byte total of the files involved
    pub total_file_size: u64,
    /// Progress in cost units
    pub progress: u64,
    /// Progress denominator (sum of step costs)
    pub total_cost: u64,
    pub transfer_bps: u64,
    pub progress_bps: u64,
    pub paused: bool,
    pub limit: SpeedLimit,
}

impl StatusSnapshot {
    pub fn remaining_cost(&self) -> u64 {
        self.total_cost.saturating_sub(self.progress)
    }
}

/// Smallest buffer the progress tuner will shrink to
const MIN_PROGRESS_CHUNK: usize = 4096;

struct StatusInner {
    transferred: u64,
    progress: u64,
    total_cost: u64,
    total_file_size: u64,
    transfer_meter: SpeedMeter,
    progress_meter: SpeedMeter,
    limiter: SpeedLimiter,
    /// Rolling cap keeping progress updates frequent on slow links
    progress_buffer_limit: usize,
    paused: bool,
}

/// Handle to one operation's shared status; clones share the same state
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<Mutex<StatusInner>>,
    epoch: Instant,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusInner {
                transferred: 0,
                progress: 0,
                total_cost: 0,
                total_file_size: 0,
                transfer_meter: SpeedMeter::new(TRANSFER_METER),
                progress_meter: SpeedMeter::new(PROGRESS_METER),
                limiter: SpeedLimiter::new(),
                progress_buffer_limit: usize::MAX,
                paused: false,
            })),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Reset for a starting operation and seed the denominators
    pub fn begin(&self, total_cost: u64, total_file_size: u64, limit: SpeedLimit) {
        let now = self.now_ms();
        let mut inner = self.inner.lock();
        inner.transferred = 0;
        inner.progress = 0;
        inner.total_cost = total_cost;
        inner.total_file_size = total_file_size;
        inner.transfer_meter.just_connected(now);
        inner.progress_meter.just_connected(now);
        inner.limiter.set_limit(limit, now);
        inner.progress_buffer_limit = usize::MAX;
        inner.paused = false;
    }

    /// Account one flushed copy buffer and plan the next burst
    ///
    /// `only_progress` excludes the bytes from the transferred counter
    /// and the transfer meter (used by convert steps, which rewrite data
    /// without transferring it anywhere).
    pub fn record_chunk(
        &self,
        bytes: u64,
        max_packet: u64,
        default_buffer: usize,
        only_progress: bool,
    ) -> BurstPlan {
        let now = self.now_ms();
        let mut inner = self.inner.lock();
        if !only_progress {
            if inner.transfer_meter.reset_pending {
                inner.transfer_meter.just_connected(now);
            }
            inner.transfer_meter.bytes_received(bytes, now, max_packet);
            inner.transferred += bytes;
        }
        inner.progress_meter.bytes_received(bytes, now, max_packet);
        inner.progress += bytes;
        if !only_progress {
            // Convert steps rewrite in place; the throttle only paces
            // actual transfers
            inner.limiter.record(bytes);
        }
        let mut plan = inner.limiter.plan(default_buffer, now);

        // Keep progress updates flowing on slow links by shrinking the
        // buffer, independently of any throttle
        let tuned = inner.transfer_meter.adjust_buffer_limit(
            inner.progress_buffer_limit.min(default_buffer),
            MIN_PROGRESS_CHUNK,
        );
        inner.progress_buffer_limit = tuned;
        plan.buffer_limit = plan.buffer_limit.min(tuned);
        plan
    }

    /// Advance progress by a completed step's cost (non-copy steps)
    pub fn add_step_progress(&self, cost: u64) {
        if cost == 0 {
            return;
        }
        let now = self.now_ms();
        let mut inner = self.inner.lock();
        inner.progress += cost;
        inner.progress_meter.bytes_received(cost, now, 0);
    }

    /// True the progress counter up to an absolute value after a step
    /// completed; copy steps drift from their cost by design
    pub fn settle_progress(&self, absolute: u64) {
        let now = self.now_ms();
        let mut inner = self.inner.lock();
        if absolute > inner.progress {
            let delta = absolute - inner.progress;
            inner.progress_meter.bytes_received(delta, now, 0);
        }
        inner.progress = absolute;
    }

    /// True the transferred counter up to the pre-scanned file size;
    /// files can change on disk while the operation runs
    pub fn settle_transferred(&self, expected: u64, actual: u64) {
        if expected == actual {
            return;
        }
        let mut inner = self.inner.lock();
        inner.transferred = inner
            .transferred
            .saturating_add(expected)
            .saturating_sub(actual);
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    /// Restart both meters and the throttle window; called on resume so
    /// the pause does not read as a falsely depressed rate
    pub fn reset_meters(&self) {
        let now = self.now_ms();
        let mut inner = self.inner.lock();
        inner.transfer_meter.just_connected(now);
        inner.progress_meter.just_connected(now);
        inner.limiter.rebase(now);
    }

    /// Swap the throttle pair; the worker observes the change at its
    /// next buffer boundary
    pub fn set_speed_limit(&self, limit: SpeedLimit) {
        let now = self.now_ms();
        self.inner.lock().limiter.set_limit(limit, now);
    }

    pub fn speed_limit(&self) -> SpeedLimit {
        self.inner.lock().limiter.limit()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let now = self.now_ms();
        let mut inner = self.inner.lock();
        let transfer_bps = inner.transfer_meter.speed(now);
        let progress_bps = inner.progress_meter.speed(now);
        StatusSnapshot {
            transferred: inner.transferred,
            total_file_size: inner.total_file_size,
            progress: inner.progress,
            total_cost: inner.total_cost,
            transfer_bps,
            progress_bps,
            paused: inner.paused,
            limit: inner.limiter.limit(),
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
