//! Throughput cap for copy/move workers
//!
//! The limiter turns a configured bytes-per-second cap into a pair of
//! working parameters: how much to read per burst and how long to sleep
//! afterwards. Sleeps are batched so a tight cap does not degenerate
//! into a sleep after every small write, and the parameters are only
//! recomputed periodically to avoid oscillation.

use std::time::Duration;

/// Caps at or above this throttle by braking once per
/// `limit / HIGH_SPEED_LIMIT_BRAKE_DIV` bytes instead of per buffer
pub const HIGH_SPEED_LIMIT: u64 = 1024 * 1024;
pub const HIGH_SPEED_LIMIT_BRAKE_DIV: u64 = 10;

/// How often the working parameters are re-derived from observed traffic
const SETUP_INTERVAL_MS: u64 = 1000;

/// The cap pair is always read and written together so a worker never
/// observes a half-updated limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedLimit {
    pub enabled: bool,
    /// Bytes per second; must never be zero while enabled
    pub bytes_per_sec: u64,
}

impl SpeedLimit {
    pub fn off() -> Self {
        Self {
            enabled: false,
            bytes_per_sec: 0,
        }
    }

    pub fn capped(bytes_per_sec: u64) -> Self {
        debug_assert!(bytes_per_sec > 0, "speed limit must not be zero");
        Self {
            enabled: bytes_per_sec > 0,
            bytes_per_sec,
        }
    }
}

/// What the worker should do for its next I/O burst
#[derive(Debug, Clone, Copy)]
pub struct BurstPlan {
    pub buffer_limit: usize,
    pub sleep: Duration,
}

#[derive(Debug)]
pub struct SpeedLimiter {
    limit: SpeedLimit,
    window_start_ms: u64,
    bytes_in_window: u64,
}

impl SpeedLimiter {
    pub fn new() -> Self {
        Self {
            limit: SpeedLimit::off(),
            window_start_ms: 0,
            bytes_in_window: 0,
        }
    }

    pub fn limit(&self) -> SpeedLimit {
        self.limit
    }

    /// Install a new cap; the measurement window restarts so the old
    /// rate does not bleed into the new one
    pub fn set_limit(&mut self, limit: SpeedLimit, now_ms: u64) {
        self.limit = limit;
        self.rebase(now_ms);
    }

    /// Restart the measurement window (after a pause or error prompt,
    /// so the idle time is not counted as budget for a burst)
    pub fn rebase(&mut self, now_ms: u64) {
        self.window_start_ms = now_ms;
        self.bytes_in_window = 0;
    }

    /// Account bytes that just moved
    pub fn record(&mut self, bytes: u64) {
        if self.limit.enabled {
            self.bytes_in_window += bytes;
        }
    }

    /// Compute the next burst: buffer cap and the sleep owed so far
    pub fn plan(&mut self, default_buffer: usize, now_ms: u64) -> BurstPlan {
        if !self.limit.enabled || self.limit.bytes_per_sec == 0 {
            return BurstPlan {
                buffer_limit: default_buffer,
                sleep: Duration::ZERO,
            };
        }

        let cap = self.limit.bytes_per_sec;
        let brake_chunk = (cap / HIGH_SPEED_LIMIT_BRAKE_DIV).max(1);
        let buffer_limit = (brake_chunk as usize).clamp(1, default_buffer.max(1));

        if now_ms < self.window_start_ms {
            self.rebase(now_ms);
        }
        let elapsed = now_ms - self.window_start_ms;
        let owed_ms = self.bytes_in_window * 1000 / cap;
        let sleep = if owed_ms > elapsed {
            Duration::from_millis(owed_ms - elapsed)
        } else {
            // Ahead of schedule or idle; shrink the window so an idle
            // stretch cannot bank an unlimited burst
            if elapsed > owed_ms + SETUP_INTERVAL_MS {
                self.rebase(now_ms);
            }
            Duration::ZERO
        };

        // Bound the window so the counters cannot grow without limit
        if elapsed > 8 * SETUP_INTERVAL_MS {
            self.window_start_ms = now_ms.saturating_sub(SETUP_INTERVAL_MS);
            self.bytes_in_window = cap * SETUP_INTERVAL_MS / 1000;
        }

        BurstPlan {
            buffer_limit,
            sleep,
        }
    }
}

impl Default for SpeedLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_limiter_never_sleeps() {
        let mut limiter = SpeedLimiter::new();
        limiter.record(100_000_000);
        let plan = limiter.plan(320 * 1024, 1000);
        assert_eq!(plan.buffer_limit, 320 * 1024);
        assert_eq!(plan.sleep, Duration::ZERO);
    }

    #[test]
    fn test_high_cap_brakes_per_tenth() {
        let mut limiter = SpeedLimiter::new();
        limiter.set_limit(SpeedLimit::capped(4 * 1024 * 1024), 0);
        let plan = limiter.plan(320 * 1024, 0);
        // 4 MiB/s -> brake every 409.6 KiB, clamped to the buffer
        assert_eq!(plan.buffer_limit, 320 * 1024);

        let mut limiter = SpeedLimiter::new();
        limiter.set_limit(SpeedLimit::capped(1024 * 1024), 0);
        let plan = limiter.plan(320 * 1024, 0);
        assert_eq!(plan.buffer_limit, (1024 * 1024 / 10) as usize);
    }

    #[test]
    fn test_sustained_transfer_converges_to_cap() {
        // 10 MB at 1 MB/s must take ~10 simulated seconds
        let cap = 1_000_000u64;
        let total = 10_000_000u64;
        let mut limiter = SpeedLimiter::new();
        limiter.set_limit(SpeedLimit::capped(cap), 0);

        let mut now_ms = 0u64;
        let mut moved = 0u64;
        while moved < total {
            let plan = limiter.plan(320 * 1024, now_ms);
            now_ms += plan.sleep.as_millis() as u64;
            let chunk = (plan.buffer_limit as u64).min(total - moved);
            // The transfer itself is instantaneous in this simulation
            limiter.record(chunk);
            moved += chunk;
        }
        let final_plan = limiter.plan(320 * 1024, now_ms);
        now_ms += final_plan.sleep.as_millis() as u64;

        let expected_ms = total * 1000 / cap;
        assert!(
            now_ms >= expected_ms * 9 / 10 && now_ms <= expected_ms * 11 / 10,
            "simulated duration {} ms, expected ~{} ms",
            now_ms,
            expected_ms
        );
    }

    #[test]
    fn test_rebase_forgets_idle_budget() {
        let mut limiter = SpeedLimiter::new();
        limiter.set_limit(SpeedLimit::capped(1_000_000), 0);
        limiter.record(1_000_000);
        // One second of work moved one second of budget: nothing owed
        assert_eq!(limiter.plan(320 * 1024, 1000).sleep, Duration::ZERO);

        limiter.rebase(5000);
        limiter.record(500_000);
        let plan = limiter.plan(320 * 1024, 5000);
        assert_eq!(plan.sleep, Duration::from_millis(500));
    }
}
