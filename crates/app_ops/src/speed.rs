//! Sliding-window byte-rate estimation
//!
//! One meter type, two profiles: the transfer meter feeds the speed
//! readout, the progress meter feeds the time-left estimate. Interval
//! buckets answer for steady traffic; a ring of recent packets answers
//! for slow or intermittent traffic where whole buckets would read as
//! zero. Timestamps come in as milliseconds so the math stays testable
//! without a real clock.

/// Window geometry of one meter instance
#[derive(Debug, Clone, Copy)]
pub struct MeterProfile {
    /// Sample interval in milliseconds (must not be 0)
    pub bucket_ms: u64,
    /// Number of completed samples kept (more samples smooth the drop
    /// when the oldest entry falls out of the queue)
    pub buckets: usize,
    /// Number of recent packets remembered for low-speed estimation
    pub packets: usize,
    /// Minimum span between the oldest and newest stored packet before
    /// the packet ring may answer
    pub min_packet_span_ms: u64,
}

/// Transfer speed: 200 ms buckets, 5 s window, 40 packets
pub const TRANSFER_METER: MeterProfile = MeterProfile {
    bucket_ms: 200,
    buckets: 25,
    packets: 40,
    min_packet_span_ms: 2000,
};

/// Progress speed: 500 ms buckets, 30 s window, 100 packets
pub const PROGRESS_METER: MeterProfile = MeterProfile {
    bucket_ms: 500,
    buckets: 60,
    packets: 100,
    min_packet_span_ms: 10_000,
};

/// Sliding-window byte-rate estimator
pub struct SpeedMeter {
    profile: MeterProfile,

    /// Circular queue of bytes per interval; one extra working slot
    /// accumulates the current interval
    bucket_bytes: Vec<u64>,
    /// Index of the working slot
    act_index: usize,
    /// Timestamp boundary (ms) of the working slot; bytes accumulate
    /// into it until this time
    act_time_limit: u64,
    /// Populated slots, working slot included
    bucket_count: usize,

    /// Circular queues of the last N+1 packet sizes and receive times
    packet_size: Vec<u64>,
    packet_time: Vec<u64>,
    /// Next write position; when full it is also the oldest packet
    packet_index: usize,
    packet_count: usize,

    /// Largest packet size announced for the next interval
    max_packet: u64,

    /// The speed collapsed to zero while data was still flowing; the
    /// owner should clear the meter before the next measurement
    pub reset_pending: bool,
}

impl SpeedMeter {
    pub fn new(profile: MeterProfile) -> Self {
        Self {
            profile,
            bucket_bytes: vec![0; profile.buckets + 1],
            act_index: 0,
            act_time_limit: 0,
            bucket_count: 0,
            packet_size: vec![0; profile.packets + 1],
            packet_time: vec![0; profile.packets + 1],
            packet_index: 0,
            packet_count: 0,
            max_packet: 0,
            reset_pending: false,
        }
    }

    /// Reset the meter for reuse
    pub fn clear(&mut self) {
        self.bucket_bytes.fill(0);
        self.act_index = 0;
        self.act_time_limit = 0;
        self.bucket_count = 0;
        self.packet_size.fill(0);
        self.packet_time.fill(0);
        self.packet_index = 0;
        self.packet_count = 0;
        self.max_packet = 0;
        self.reset_pending = false;
    }

    /// Start measuring; call when the operation (re)starts
    pub fn just_connected(&mut self, now_ms: u64) {
        self.clear();
        self.bucket_bytes[0] = 0;
        self.act_index = 0;
        self.act_time_limit = now_ms + self.profile.bucket_ms;
        self.bucket_count = 1;
        // Seed the packet ring so a span exists once real data arrives
        self.push_packet(0, now_ms);
    }

    /// Report a transferred chunk: `count` bytes at `now_ms`;
    /// `max_packet` is the largest chunk expected before the next call
    pub fn bytes_received(&mut self, count: u64, now_ms: u64, max_packet: u64) {
        if self.bucket_count == 0 {
            self.just_connected(now_ms);
        }
        if max_packet > 0 {
            self.max_packet = max_packet;
        }
        if count > 0 {
            self.push_packet(count, now_ms);
        }

        if now_ms < self.act_time_limit {
            // Still within the current interval
            self.bucket_bytes[self.act_index] += count;
        } else {
            // Close the working slot, then skip the intervals during
            // which nothing arrived
            let slots = self.bucket_bytes.len();
            let empty = ((now_ms - self.act_time_limit) / self.profile.bucket_ms) as usize;
            let zeroed = empty.min(self.profile.buckets);
            if zeroed > 0 && self.bucket_count <= self.profile.buckets {
                self.bucket_count = (self.bucket_count + zeroed).min(self.profile.buckets + 1);
            }
            for _ in 0..zeroed {
                self.act_index = (self.act_index + 1) % slots;
                self.bucket_bytes[self.act_index] = 0;
            }
            self.act_time_limit += (empty as u64 + 1) * self.profile.bucket_ms;
            self.act_index = (self.act_index + 1) % slots;
            if self.bucket_count <= self.profile.buckets {
                self.bucket_count += 1;
            }
            self.bucket_bytes[self.act_index] = count;
        }
    }

    /// Current rate in bytes per second; 0 when there is not enough data
    pub fn speed(&mut self, now_ms: u64) -> u64 {
        if self.bucket_count == 0 {
            return 0;
        }

        let bucket_speed = self.bucket_speed(now_ms);
        if bucket_speed > 0 {
            return bucket_speed;
        }

        let packet_speed = self.packet_speed(now_ms);
        if packet_speed > 0 {
            return packet_speed;
        }

        // Data flowed earlier but both estimators read zero now; ask the
        // owner to restart measurement instead of showing a stale zero
        if self.bucket_count > 1 {
            self.reset_pending = true;
        }
        0
    }

    fn bucket_speed(&self, now_ms: u64) -> u64 {
        if self.bucket_count <= 1 {
            // Only the working slot exists; a single partial interval is
            // not a rate
            return 0;
        }
        let slots = self.bucket_bytes.len();
        let mut total: u64 = 0;
        let mut act_index_added = 0usize;
        let mut empty = 0usize;
        let rest_time;
        let mut add_from_buckets = self.bucket_count - 1;

        if now_ms >= self.act_time_limit {
            // Working slot is already closed; account for the silent
            // intervals since then
            empty = (((now_ms - self.act_time_limit) / self.profile.bucket_ms) as usize)
                .min(self.profile.buckets);
            rest_time = (now_ms - self.act_time_limit) % self.profile.bucket_ms;
            if empty < self.profile.buckets {
                total = self.bucket_bytes[self.act_index];
                act_index_added = 1;
            }
            add_from_buckets = (self.profile.buckets - act_index_added - empty)
                .min(self.bucket_count - 1);
        } else {
            rest_time = now_ms + self.profile.bucket_ms - self.act_time_limit;
            total = self.bucket_bytes[self.act_index];
        }

        let mut index = self.act_index;
        for _ in 0..add_from_buckets {
            index = if index == 0 { slots - 1 } else { index - 1 };
            total += self.bucket_bytes[index];
        }

        let elapsed =
            (add_from_buckets + act_index_added + empty) as u64 * self.profile.bucket_ms + rest_time;
        if elapsed > 0 {
            total * 1000 / elapsed
        } else {
            0
        }
    }

    fn packet_speed(&self, now_ms: u64) -> u64 {
        if self.packet_count < 2 {
            return 0;
        }
        let slots = self.packet_size.len();
        let oldest = if self.packet_count == slots {
            self.packet_index
        } else {
            0
        };
        let newest = (self.packet_index + slots - 1) % slots;
        let span = self.packet_time[newest].saturating_sub(self.packet_time[oldest]);
        if span < self.profile.min_packet_span_ms {
            return 0;
        }
        // Stored packets describe dead traffic once nothing new arrived
        // for a whole minimum span
        if now_ms.saturating_sub(self.packet_time[newest]) > self.profile.min_packet_span_ms {
            return 0;
        }

        // Bytes received since the oldest stored packet
        let mut total: u64 = 0;
        let mut index = (oldest + 1) % slots;
        loop {
            total += self.packet_size[index];
            if index == newest {
                break;
            }
            index = (index + 1) % slots;
        }
        total * 1000 / span
    }

    /// Tune the copy buffer so progress keeps updating at least about
    /// once per sample interval; an oversized buffer on a slow link
    /// freezes the bar between chunks
    pub fn adjust_buffer_limit(&self, current: usize, floor: usize) -> usize {
        if self.packet_count < 2 || self.max_packet == 0 {
            return current;
        }
        let slots = self.packet_size.len();
        let oldest = if self.packet_count == slots {
            self.packet_index
        } else {
            0
        };
        let newest = (self.packet_index + slots - 1) % slots;
        let span = self.packet_time[newest].saturating_sub(self.packet_time[oldest]);
        if span == 0 {
            return current;
        }
        let mut bytes: u64 = 0;
        let mut index = (oldest + 1) % slots;
        loop {
            bytes += self.packet_size[index];
            if index == newest {
                break;
            }
            index = (index + 1) % slots;
        }
        let rate = bytes * 1000 / span;
        if rate == 0 {
            return current;
        }

        // How long the next expected chunk will take at the observed rate
        let chunk_ms = self.max_packet.saturating_mul(1000) / rate;
        if chunk_ms > 2 * self.profile.bucket_ms {
            (current / 2).max(floor)
        } else if chunk_ms * 4 < self.profile.bucket_ms {
            current.saturating_mul(2)
        } else {
            current
        }
    }

    fn push_packet(&mut self, size: u64, time_ms: u64) {
        self.packet_size[self.packet_index] = size;
        self.packet_time[self.packet_index] = time_ms;
        self.packet_index = (self.packet_index + 1) % self.packet_size.len();
        if self.packet_count < self.packet_size.len() {
            self.packet_count += 1;
        }
    }
}
