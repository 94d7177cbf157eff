//! Randomized exponential backoff shared by the socket pool's connect retry
//! and (via re-export) the RPC layer's throttle/health backoff.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap_multiplier: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap_multiplier: u32) -> Self {
        Backoff { base, cap_multiplier, current: base }
    }

    /// The duration to sleep for the *next* retry, then doubles `current`
    /// (clamped at `base * cap_multiplier`) for the one after that.
    pub fn next_delay(&mut self) -> Duration {
        let jittered = jitter(self.current);
        let doubled = self.current.saturating_mul(2);
        let cap = self.base.saturating_mul(self.cap_multiplier);
        self.current = doubled.min(cap);
        jittered
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Returns a uniformly random duration in `[0.5 * d, d]`, as full-jitter
/// backoff algorithms do.
pub fn jitter(d: Duration) -> Duration {
    let half = d.as_nanos() as f64 / 2.0;
    let extra = rand::thread_rng().gen_range(0.0..=half);
    Duration::from_nanos((half + extra) as u64)
}

/// Returns a uniformly random duration in `[low, high]`, used for the
/// health-state "disabled-until" window (spec §4.E).
pub fn uniform(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let span = (high - low).as_nanos() as u64;
    let extra = rand::thread_rng().gen_range(0..=span);
    low + Duration::from_nanos(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), 128);
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(100 * 128));
            last = delay;
        }
        let _ = last;
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_millis(50), 4);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(50));
    }
}
