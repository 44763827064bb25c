//! Periodic launcher status logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LAUNCHER_STATUS_INTERVAL;
use crate::rate_limiter::RateLimiter;
use crate::utils::format::friendly_ms;

/// Counters shared between a launcher run and its status ticker.
#[derive(Debug)]
pub(crate) struct LaunchProgress {
    pub(crate) total: u64,
    pub(crate) started: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) started_at: Instant,
}

impl LaunchProgress {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn in_flight(&self) -> u64 {
        self.started
            .load(Ordering::SeqCst)
            .saturating_sub(self.completed.load(Ordering::SeqCst))
    }
}

/// Logs one status line for the run.
pub(crate) async fn log_status(name: &str, progress: &LaunchProgress, limiter: &RateLimiter) {
    let snapshot = limiter.snapshot().await;
    info!(
        "[{}] elapsed: {}, done: {}/{}, in flight: {}, stalled: {}, rate: {}/sec (limit {}/sec, ~{:.0} docs/sec), detected max: {}/sec",
        name,
        friendly_ms(progress.started_at.elapsed().as_millis() as f64),
        progress.completed.load(Ordering::SeqCst),
        progress.total,
        progress.in_flight(),
        snapshot.stalled,
        snapshot.observed_rate,
        snapshot.current_rate,
        f64::from(snapshot.current_rate) * snapshot.rate_modifier,
        snapshot.detected_max
    );
}

/// Spawns a ticker that logs the run's status until `cancel` fires.
pub(crate) fn spawn_status_ticker(
    name: String,
    progress: Arc<LaunchProgress>,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LAUNCHER_STATUS_INTERVAL);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    log_status(&name, &progress, &limiter).await;
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::LimiterSettings;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_on_cancel() {
        let progress = Arc::new(LaunchProgress::new(10));
        let limiter = Arc::new(RateLimiter::new(LimiterSettings::new(10, 2, 20.0)));
        let cancel = CancellationToken::new();

        let handle = spawn_status_ticker(
            "test".to_string(),
            Arc::clone(&progress),
            limiter,
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.expect("ticker should exit cleanly");
    }

    #[test]
    fn test_in_flight_never_negative() {
        let progress = LaunchProgress::new(3);
        progress.completed.store(2, Ordering::SeqCst);
        assert_eq!(progress.in_flight(), 0);

        progress.started.store(3, Ordering::SeqCst);
        assert_eq!(progress.in_flight(), 1);
    }
}
