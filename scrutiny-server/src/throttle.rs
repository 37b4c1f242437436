use std::time::{Duration, Instant};

/// Leaky-bucket bitrate throttler. Tokens (bits) accumulate at `max_bitrate_bps`
/// and saturate at one second's worth of capacity, so the throttler never
/// stalls indefinitely after an idle period — it just lets a burst through up
/// to the cap, then settles back to the configured mean rate.
pub struct Throttler {
    enabled: bool,
    max_bitrate_bps: f64,
    capacity_bits: f64,
    tokens_bits: f64,
    last_refill: Instant,
}

impl Throttler {
    pub fn new(enabled: bool, max_bitrate_bps: u32) -> Self {
        let capacity_bits = max_bitrate_bps as f64;
        Self {
            enabled,
            max_bitrate_bps: max_bitrate_bps as f64,
            capacity_bits,
            tokens_bits: capacity_bits,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens_bits = (self.tokens_bits + dt * self.max_bitrate_bps).min(self.capacity_bits);
        self.last_refill = now;
    }

    /// Attempts to spend `bits` now. Returns `true` and deducts the tokens if
    /// admissible; otherwise leaves the bucket untouched.
    pub fn try_consume(&mut self, now: Instant, bits: u64) -> bool {
        if !self.enabled {
            return true;
        }
        self.refill(now);
        let bits = bits as f64;
        if self.tokens_bits >= bits {
            self.tokens_bits -= bits;
            true
        } else {
            false
        }
    }

    /// How long until `bits` would be admissible, given the current backlog.
    pub fn time_until_admissible(&mut self, now: Instant, bits: u64) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        self.refill(now);
        let deficit = bits as f64 - self.tokens_bits;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.max_bitrate_bps)
        }
    }

    pub fn backlog_bits(&self, now: Instant, bits: u64) -> u64 {
        let mut probe = Throttler {
            enabled: self.enabled,
            max_bitrate_bps: self.max_bitrate_bps,
            capacity_bits: self.capacity_bits,
            tokens_bits: self.tokens_bits,
            last_refill: self.last_refill,
        };
        probe.refill(now);
        (bits as f64 - probe.tokens_bits).max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_blocks() {
        let mut t = Throttler::new(false, 100);
        assert!(t.try_consume(Instant::now(), 10_000));
    }

    #[test]
    fn saturates_at_capacity_after_idle() {
        let mut t = Throttler::new(true, 1000);
        let later = Instant::now() + Duration::from_secs(10);
        assert!(t.try_consume(later, 1000));
        assert!(!t.try_consume(later, 1));
    }

    #[test]
    fn mean_rate_bounded_over_window() {
        let mut t = Throttler::new(true, 5000);
        let start = Instant::now();
        let mut sent_bits = 0u64;
        let mut now = start;
        for _ in 0..100_000 {
            now += Duration::from_millis(1);
            if t.try_consume(now, 166) {
                sent_bits += 166;
            }
        }
        let elapsed = now.duration_since(start).as_secs_f64();
        let mean_bps = sent_bits as f64 / elapsed;
        assert!(mean_bps <= 6000.0, "mean bitrate too high: {mean_bps}");
    }
}
