//! Health-state transitions driven by response codes (spec §4.E).

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;

use goma_proto::HealthStatus;

const DISABLE_WINDOW_MIN: Duration = Duration::from_secs(10 * 60);
const DISABLE_WINDOW_MAX: Duration = Duration::from_secs(20 * 60);
const RAMP_UP_DURATION: Duration = Duration::from_secs(10 * 60);

const BACKOFF_FACTOR: f64 = 1.4;

pub struct HealthState {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    backoff: Duration,
    disabled_until: Option<Instant>,
    ramp_up_started: Option<Instant>,
    last_network_error: Option<Instant>,
    fail_fast: bool,
}

impl HealthState {
    pub fn new(min_backoff: Duration, max_backoff: Duration, fail_fast: bool) -> Self {
        HealthState {
            min_backoff,
            max_backoff,
            backoff: min_backoff,
            disabled_until: None,
            ramp_up_started: None,
            last_network_error: None,
            fail_fast,
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// `302`/`401`/`403` — extend the disabled-until window (spec §4.E).
    pub fn on_rejected(&mut self, now: Instant) {
        let extra = rand_duration(DISABLE_WINDOW_MIN, DISABLE_WINDOW_MAX);
        self.disabled_until = Some(now + extra);
        self.last_network_error = Some(now);
    }

    /// `200` — if inside the disabled window, starts (or continues) a
    /// linear ramp-up; once ramp-up completes the window is cleared.
    pub fn on_success_200(&mut self, now: Instant) {
        if let Some(disabled_until) = self.disabled_until {
            if now >= disabled_until {
                self.disabled_until = None;
                self.ramp_up_started = None;
                return;
            }
            let started = *self.ramp_up_started.get_or_insert(now);
            if now.duration_since(started) >= RAMP_UP_DURATION {
                self.disabled_until = None;
                self.ramp_up_started = None;
            }
        }
    }

    /// Other 2xx — clears the last network error and decreases backoff.
    pub fn on_success_other_2xx(&mut self) {
        self.last_network_error = None;
        let decreased = self.backoff.as_secs_f64() / BACKOFF_FACTOR;
        self.backoff = Duration::from_secs_f64(decreased).clamp(self.min_backoff, self.max_backoff);
    }

    /// Other non-2xx — increases backoff multiplicatively.
    pub fn on_failure(&mut self) {
        let increased = self.backoff.as_secs_f64() * BACKOFF_FACTOR;
        self.backoff = Duration::from_secs_f64(increased).clamp(self.min_backoff, self.max_backoff);
    }

    /// Ratio in `[0.0, 1.0]` of requests that should be let through right
    /// now, per the linear ramp-up (spec §4.E).
    pub fn available_ratio(&self, now: Instant) -> f64 {
        match (self.disabled_until, self.ramp_up_started) {
            (Some(disabled_until), _) if now < disabled_until && self.ramp_up_started.is_none() => 0.0,
            (Some(_), Some(started)) => {
                let elapsed = now.saturating_duration_since(started);
                (elapsed.as_secs_f64() / RAMP_UP_DURATION.as_secs_f64()).clamp(0.0, 1.0)
            }
            _ => 1.0,
        }
    }

    pub fn fail_now(&self, now: Instant) -> bool {
        self.fail_fast && self.disabled_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn status_string(&self, now: Instant) -> HealthStatus {
        if self.disabled_until.map(|until| now < until).unwrap_or(false) {
            return HealthStatus::access_rejected(self.fail_fast);
        }
        HealthStatus::Ok
    }
}

fn rand_duration(min: Duration, max: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let span = max.as_secs_f64() - min.as_secs_f64();
    if span <= 0.0 {
        return min;
    }
    Duration::from_secs_f64(min.as_secs_f64() + rng.gen_range(0.0..span))
}

/// Randomized throttle-retry backoff in `[0.6*backoff, backoff]` (spec
/// §4.E step 3).
pub fn throttle_retry_delay(backoff: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.6..=1.0);
    Duration::from_secs_f64(backoff.as_secs_f64() * factor)
}

pub fn warn_on_lzma2_quirk() {
    warn!("server advertised lzma2 in Accept-Encoding; disabling request compression entirely (reproduced quirk, spec open question 9a)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_then_success_inside_window_does_not_immediately_clear() {
        let mut health = HealthState::new(Duration::from_millis(1), Duration::from_secs(60), true);
        let t0 = Instant::now();
        health.on_rejected(t0);
        assert!(health.fail_now(t0));
        health.on_success_200(t0);
        assert!(health.fail_now(t0), "still inside the disabled window, ramp-up just started");
    }

    #[test]
    fn failure_increases_backoff_by_the_documented_factor() {
        let mut health = HealthState::new(Duration::from_secs(1), Duration::from_secs(60), false);
        health.on_failure();
        assert!((health.backoff().as_secs_f64() - 1.4).abs() < 1e-9);
    }

    #[test]
    fn success_decreases_backoff_and_clamps_to_min() {
        let mut health = HealthState::new(Duration::from_secs(1), Duration::from_secs(60), false);
        health.on_success_other_2xx();
        assert_eq!(health.backoff(), Duration::from_secs(1));
    }

    #[test]
    fn throttle_retry_delay_stays_within_the_06_to_1_band() {
        let backoff = Duration::from_secs(10);
        for _ in 0..50 {
            let delay = throttle_retry_delay(backoff);
            assert!(delay >= Duration::from_secs(6) && delay <= Duration::from_secs(10));
        }
    }
}
