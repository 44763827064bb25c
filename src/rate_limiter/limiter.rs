//! Adaptive rate limiter implementation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::window::InFlightWindow;
use crate::config::{
    ADMISSION_POLL_INTERVAL, DECREASE_DEBOUNCE, INCREASE_COOLDOWN, RATE_LIMIT_COOLDOWN,
    RATE_WINDOW,
};
use crate::launcher::LaunchControl;

/// Tuning of the rate limiter.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Upper bound on requests per second
    pub max_rate: u32,
    /// Floor for the allowed rate
    pub min_rate: u32,
    /// Percent of the rate limit left unused, in `[0, 100)`
    pub head_room_percent: f64,
    /// Starting allowed rate (defaults to `min_rate`)
    pub initial_rate: Option<u32>,
    /// Further decreases are ignored for this long after a decrease
    pub decrease_debounce: Duration,
    /// Increases are suppressed for this long after a 429
    pub rate_limit_cooldown: Duration,
    /// Minimum spacing between two increases
    pub increase_cooldown: Duration,
    /// Window used to compute the observed rate
    pub rate_window: Duration,
}

impl LimiterSettings {
    pub fn new(max_rate: u32, min_rate: u32, head_room_percent: f64) -> Self {
        LimiterSettings {
            max_rate,
            min_rate,
            head_room_percent,
            initial_rate: None,
            decrease_debounce: DECREASE_DEBOUNCE,
            rate_limit_cooldown: RATE_LIMIT_COOLDOWN,
            increase_cooldown: INCREASE_COOLDOWN,
            rate_window: RATE_WINDOW,
        }
    }

    /// Share of the rate limit we allow ourselves to use.
    pub fn usable_fraction(&self) -> f64 {
        1.0 - self.head_room_percent / 100.0
    }

    /// Highest allowed rate, never below the floor.
    pub fn ceiling(&self) -> u32 {
        let ceiling = (f64::from(self.max_rate) * self.usable_fraction()).floor() as u32;
        ceiling.max(self.min_rate)
    }
}

/// Result of waiting for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may be sent now; its start has been recorded.
    Admitted,
    /// The caller aborted while the request was waiting.
    Aborted,
}

/// Point-in-time view of the limiter, for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSnapshot {
    pub current_rate: u32,
    pub detected_max: u32,
    pub observed_rate: u32,
    pub in_flight: usize,
    pub stalled: usize,
    pub rate_modifier: f64,
}

#[derive(Debug)]
struct RateState {
    current_rate: u32,
    detected_max: u32,
    decrease_blocked_until: Option<Instant>,
    limit_hit_until: Option<Instant>,
    next_increase_at: Option<Instant>,
    rate_modifier: f64,
    window: InFlightWindow,
}

/// Adaptive limiter that discovers an undisclosed upstream rate limit.
///
/// Multiplicative decrease on 429, linear increase otherwise:
/// - On a 429: the observed rate (requests started in the last second that are
///   still in flight) is taken as the real limit, and the allowed rate drops to
///   that value minus headroom, or by at least one. Further decreases are
///   debounced, and increases are suppressed for a long cooldown.
/// - On any other response: the allowed rate grows by one, at most once per
///   increase cooldown, never past the ceiling.
///
/// The unit is requests per second. The rate modifier (documents per request)
/// only scales logged figures.
pub struct RateLimiter {
    settings: LimiterSettings,
    state: Mutex<RateState>,
    stalled: AtomicUsize,
}

impl RateLimiter {
    pub fn new(settings: LimiterSettings) -> Self {
        let initial = settings
            .initial_rate
            .unwrap_or(settings.min_rate)
            .clamp(settings.min_rate, settings.ceiling());
        let window = InFlightWindow::new(settings.rate_window);
        RateLimiter {
            settings,
            state: Mutex::new(RateState {
                current_rate: initial,
                detected_max: 0,
                decrease_blocked_until: None,
                limit_hit_until: None,
                next_increase_at: None,
                rate_modifier: 1.0,
                window,
            }),
            stalled: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Sets the number of documents carried by one request.
    ///
    /// Only the logged docs/sec figures use it; the ceiling stays
    /// `max_rate × (1 − headroom)` requests per second.
    pub async fn set_rate_modifier(&self, docs_per_request: f64) {
        self.state.lock().await.rate_modifier = docs_per_request.max(1.0);
    }

    /// Gets the current allowed rate.
    pub async fn current_rate(&self) -> u32 {
        self.state.lock().await.current_rate
    }

    /// Admits `id` if fewer requests than the allowed rate are in flight.
    ///
    /// The check and the start record happen under one lock, so concurrent
    /// callers cannot overshoot the rate.
    pub async fn try_admit(&self, id: u64) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.window.observed_rate(now) < state.current_rate {
            state.window.record_start(id, now);
            true
        } else {
            false
        }
    }

    /// Waits until `id` may be sent.
    ///
    /// Re-checks on a fixed poll interval. Never admits while the caller's
    /// pause flag is set; returns [`Admission::Aborted`] once the abort flag is.
    pub async fn admit(&self, id: u64, control: &LaunchControl) -> Admission {
        let mut stalled = false;
        let admission = loop {
            if control.is_aborted() {
                break Admission::Aborted;
            }
            if !control.is_paused() && self.try_admit(id).await {
                break Admission::Admitted;
            }
            if !stalled {
                stalled = true;
                self.stalled.fetch_add(1, Ordering::Relaxed);
            }
            tokio::time::sleep(ADMISSION_POLL_INTERVAL).await;
        };
        if stalled {
            self.stalled.fetch_sub(1, Ordering::Relaxed);
        }
        admission
    }

    /// Forgets a finished request.
    pub async fn finish(&self, id: u64) {
        self.state.lock().await.window.finish(id);
    }

    /// Reacts to a 429. Returns the new rate if it was lowered.
    pub async fn on_rate_limited(&self) -> Option<u32> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if state
            .decrease_blocked_until
            .is_some_and(|until| now < until)
        {
            return None;
        }

        let observed = state.window.observed_rate(now);
        let prev_rate = state.current_rate;
        state.detected_max = observed;

        let mut next = (f64::from(observed) * self.settings.usable_fraction()).floor() as u32;
        if next >= prev_rate {
            // Always make progress downwards
            next = prev_rate.saturating_sub(1);
        }
        next = next.max(self.settings.min_rate);
        state.current_rate = next;

        state.decrease_blocked_until = Some(now + self.settings.decrease_debounce);
        state.limit_hit_until = Some(now + self.settings.rate_limit_cooldown);

        log::warn!(
            "Decreasing rate limit to {}/sec (~{:.0} docs/sec), detected max: {}/sec, prev limit: {}/sec",
            next,
            f64::from(next) * state.rate_modifier,
            observed,
            prev_rate
        );
        Some(next)
    }

    /// Reacts to a non-429 response. Returns the new rate if it was raised.
    pub async fn on_response(&self) -> Option<u32> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if state.limit_hit_until.is_some_and(|until| now < until) {
            return None;
        }
        if state.next_increase_at.is_some_and(|at| now < at) {
            return None;
        }
        let ceiling = self.settings.ceiling();
        if state.current_rate >= ceiling {
            return None;
        }

        state.current_rate = (state.current_rate + 1).min(ceiling);
        state.next_increase_at = Some(now + self.settings.increase_cooldown);
        log::debug!(
            "Increasing rate limit to {}/sec (~{:.0} docs/sec)",
            state.current_rate,
            f64::from(state.current_rate) * state.rate_modifier
        );
        Some(state.current_rate)
    }

    pub async fn snapshot(&self) -> RateSnapshot {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        RateSnapshot {
            current_rate: state.current_rate,
            detected_max: state.detected_max,
            observed_rate: state.window.observed_rate(now),
            in_flight: state.window.pending(),
            stalled: self.stalled.load(Ordering::Relaxed),
            rate_modifier: state.rate_modifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(initial: u32) -> LimiterSettings {
        LimiterSettings {
            initial_rate: Some(initial),
            ..LimiterSettings::new(50, 2, 20.0)
        }
    }

    async fn start_requests(limiter: &RateLimiter, count: u64) {
        for id in 1..=count {
            assert!(limiter.try_admit(id).await, "request {} should be admitted", id);
        }
    }

    #[test]
    fn test_settings_ceiling_and_fraction() {
        let s = LimiterSettings::new(50, 2, 20.0);
        assert!((s.usable_fraction() - 0.8).abs() < f64::EPSILON);
        assert_eq!(s.ceiling(), 40);

        // Ceiling never drops below the floor
        let tiny = LimiterSettings::new(2, 2, 90.0);
        assert_eq!(tiny.ceiling(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_rate_defaults_to_floor() {
        let limiter = RateLimiter::new(LimiterSettings::new(50, 3, 20.0));
        assert_eq!(limiter.current_rate().await, 3);

        let clamped = RateLimiter::new(settings(1000));
        assert_eq!(clamped.current_rate().await, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_admit_respects_current_rate() {
        let limiter = RateLimiter::new(settings(3));
        start_requests(&limiter, 3).await;
        assert!(!limiter.try_admit(4).await);

        limiter.finish(1).await;
        assert!(limiter.try_admit(4).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_admit_frees_slots_after_window() {
        let limiter = RateLimiter::new(settings(2));
        start_requests(&limiter, 2).await;
        assert!(!limiter.try_admit(3).await);

        // Long-running requests stop counting against the rate after a second
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.try_admit(3).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_uses_observed_rate_and_headroom() {
        let limiter = RateLimiter::new(settings(20));
        start_requests(&limiter, 12).await;

        let new_rate = limiter.on_rate_limited().await;
        // floor(12 * 0.8)
        assert_eq!(new_rate, Some(9));
        assert_eq!(limiter.current_rate().await, 9);
        assert_eq!(limiter.snapshot().await.detected_max, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_is_debounced() {
        let limiter = RateLimiter::new(settings(20));
        start_requests(&limiter, 12).await;

        assert_eq!(limiter.on_rate_limited().await, Some(9));
        assert_eq!(limiter.on_rate_limited().await, None);
        assert_eq!(limiter.current_rate().await, 9);

        tokio::time::advance(Duration::from_secs(6)).await;
        start_requests_from(&limiter, 100, 9).await;
        // Observed 9 -> floor(7.2) = 7
        assert_eq!(limiter.on_rate_limited().await, Some(7));
    }

    async fn start_requests_from(limiter: &RateLimiter, first: u64, count: u64) {
        for id in first..first + count {
            assert!(limiter.try_admit(id).await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_forces_progress_when_estimate_not_lower() {
        let limiter = RateLimiter::new(settings(5));
        start_requests(&limiter, 5).await;

        // Observed 5 at rate 5: floor(5 * 0.8) = 4 < 5, fine
        assert_eq!(limiter.on_rate_limited().await, Some(4));

        tokio::time::advance(Duration::from_secs(6)).await;
        // Nothing in flight any more: estimate 0, clamped to the floor
        assert_eq!(limiter.on_rate_limited().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_when_estimate_exceeds_rate() {
        let limiter = RateLimiter::new(settings(10));
        start_requests(&limiter, 10).await;
        limiter.finish(1).await;
        // Pretend the rate dropped below what is already in flight
        {
            let mut state = limiter.state.lock().await;
            state.current_rate = 5;
        }
        // floor(9 * 0.8) = 7 >= 5 -> 4
        assert_eq!(limiter.on_rate_limited().await, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_never_below_floor_and_strictly_decreases() {
        let limiter = RateLimiter::new(settings(30));
        let mut prev = limiter.current_rate().await;
        for round in 0..40u64 {
            start_requests_from(&limiter, round * 1000, u64::from(prev.min(8))).await;
            let next = limiter.on_rate_limited().await.expect("decrease allowed");
            assert!(next >= 2, "rate fell below the floor: {}", next);
            if prev > 2 {
                assert!(next < prev, "rate did not decrease: {} -> {}", prev, next);
            }
            prev = next;
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert_eq!(prev, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increase_is_linear_and_throttled() {
        let limiter = RateLimiter::new(settings(5));
        assert_eq!(limiter.on_response().await, Some(6));
        // Inside the increase cooldown
        assert_eq!(limiter.on_response().await, None);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(limiter.on_response().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_increase_stops_at_ceiling() {
        let limiter = RateLimiter::new(LimiterSettings {
            increase_cooldown: Duration::ZERO,
            ..settings(38)
        });
        assert_eq!(limiter.on_response().await, Some(39));
        assert_eq!(limiter.on_response().await, Some(40));
        assert_eq!(limiter.on_response().await, None);
        assert_eq!(limiter.current_rate().await, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_modifier_does_not_move_ceiling() {
        let limiter = RateLimiter::new(LimiterSettings {
            increase_cooldown: Duration::ZERO,
            ..settings(39)
        });
        limiter.set_rate_modifier(250.0).await;
        assert_eq!(limiter.snapshot().await.rate_modifier, 250.0);

        assert_eq!(limiter.on_response().await, Some(40));
        assert_eq!(limiter.on_response().await, None);
        assert_eq!(limiter.current_rate().await, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increase_suppressed_after_rate_limit() {
        let limiter = RateLimiter::new(LimiterSettings {
            increase_cooldown: Duration::ZERO,
            rate_limit_cooldown: Duration::from_secs(60),
            ..settings(10)
        });
        start_requests(&limiter, 10).await;
        assert_eq!(limiter.on_rate_limited().await, Some(8));

        for _ in 0..10 {
            assert_eq!(limiter.on_response().await, None);
        }
        assert_eq!(limiter.current_rate().await, 8);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.on_response().await, Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_never_decrease_rate() {
        let limiter = RateLimiter::new(LimiterSettings {
            increase_cooldown: Duration::from_millis(100),
            ..settings(3)
        });
        let mut prev = limiter.current_rate().await;
        for _ in 0..100 {
            limiter.on_response().await;
            let now = limiter.current_rate().await;
            assert!(now >= prev);
            prev = now;
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        assert!(prev > 3);
        assert!(prev <= 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_waits_for_capacity() {
        let limiter = std::sync::Arc::new(RateLimiter::new(settings(2)));
        let control = LaunchControl::new();
        start_requests(&limiter, 2).await;

        let waiter = {
            let limiter = std::sync::Arc::clone(&limiter);
            let control = control.clone();
            tokio::spawn(async move { limiter.admit(3, &control).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());
        assert_eq!(limiter.snapshot().await.stalled, 1);

        limiter.finish(1).await;
        let admission = waiter.await.expect("join");
        assert_eq!(admission, Admission::Admitted);
        assert_eq!(limiter.snapshot().await.stalled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_blocks_while_paused_and_honours_abort() {
        let limiter = std::sync::Arc::new(RateLimiter::new(settings(10)));
        let control = LaunchControl::new();
        control.pause();

        let waiter = {
            let limiter = std::sync::Arc::clone(&limiter);
            let control = control.clone();
            tokio::spawn(async move { limiter.admit(1, &control).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!waiter.is_finished());

        control.abort();
        assert_eq!(waiter.await.expect("join"), Admission::Aborted);
        assert_eq!(limiter.snapshot().await.in_flight, 0);
    }
}
