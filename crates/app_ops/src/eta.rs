//! Time-left estimation for the progress display
//!
//! Raw remaining-seconds figures jump around; they are rounded to a
//! small set of "human" granularities and a displayed value is only
//! replaced when it is due for a refresh or moved by more than 50%.

const UPDATE_PERIOD_MS: u64 = 100;

/// Round remaining seconds to roughly 10% error on nice numbers
/// (1, 2, 5, 10, 20, 40 scaled by powers of 60)
pub fn round_time_left(secs: u64) -> u64 {
    let mut dif = (secs + 5) / 10;
    let mut expon = 0u32;
    while dif >= 50 {
        dif /= 60;
        expon += 1;
    }
    dif = if dif <= 1 {
        1
    } else if dif <= 3 {
        2
    } else if dif <= 7 {
        5
    } else if dif < 15 {
        10
    } else if dif < 30 {
        20
    } else {
        40
    };
    for _ in 0..expon {
        dif *= 60;
    }
    (secs + dif / 2) / dif * dif
}

/// Damped time-left readout
#[derive(Debug, Default)]
pub struct TimeLeft {
    last_secs: u64,
    next_update_at: u64,
}

impl TimeLeft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous estimate (operation restarted or paused)
    pub fn reset(&mut self, now_ms: u64) {
        self.last_secs = 0;
        self.next_update_at = now_ms;
    }

    /// Compute the seconds-left value to display, or None when no
    /// estimate can be made yet
    pub fn update(&mut self, now_ms: u64, remaining: u64, rate_bps: u64) -> Option<u64> {
        if rate_bps == 0 || remaining == 0 {
            self.reset(now_ms);
            return None;
        }

        // One extra second so the operation ends at "1 sec", not "0 sec"
        let secs = round_time_left(remaining / rate_bps + 1);

        let due = now_ms >= self.next_update_at;
        let moved = self.last_secs == 0
            || secs > self.last_secs * 3 / 2
            || secs < self.last_secs / 2;
        if due || moved {
            self.last_secs = secs;
            // The longer the estimate, the fewer the updates
            let interval = if secs <= 10 {
                500
            } else if secs <= 30 {
                1000
            } else if secs <= 60 {
                2000
            } else if secs <= 300 {
                5000
            } else {
                10_000
            };
            self.next_update_at = now_ms + interval - UPDATE_PERIOD_MS / 2;
            Some(secs)
        } else {
            Some(self.last_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_granularities() {
        assert_eq!(round_time_left(1), 1);
        assert_eq!(round_time_left(9), 9);
        assert_eq!(round_time_left(34), 34);
        // Past ~50s the step is 10s
        assert_eq!(round_time_left(94), 90);
        assert_eq!(round_time_left(96), 100);
        // Minutes-scale estimates round to minutes
        assert_eq!(round_time_left(3590) % 60, 0);
        // Hour-scale estimates use multi-minute steps
        let rounded = round_time_left(7250);
        assert_eq!(rounded % 120, 0);
    }

    #[test]
    fn test_small_values_keep_precision() {
        // Granularity 1: every value under ~15s displays as-is
        for secs in 1..=14 {
            assert_eq!(round_time_left(secs), secs);
        }
    }

    #[test]
    fn test_display_damping() {
        let mut tl = TimeLeft::new();

        // 1 MB left at 10 KB/s -> ~100 s
        let first = tl.update(0, 1_000_000, 10_000).unwrap();

        // Slight rate wobble shortly after must not change the readout
        let second = tl.update(200, 980_000, 10_500).unwrap();
        assert_eq!(first, second);

        // A collapse to a quarter of the rate changes it immediately
        let third = tl.update(400, 980_000, 2_500).unwrap();
        assert!(third > first * 3 / 2);
    }

    #[test]
    fn test_no_estimate_without_rate() {
        let mut tl = TimeLeft::new();
        assert_eq!(tl.update(0, 1_000_000, 0), None);
        assert_eq!(tl.update(0, 0, 10_000), None);
    }
}
