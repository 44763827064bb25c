//! Concurrent request launcher.
//!
//! Runs a fixed number of request slots (ids `1..=count`) through the rate
//! limiter and the retrying executor:
//! - Slots are admitted in increasing id order
//! - At most `max_parallel` slots are in flight; the limiter does the real
//!   throttling, this bound only caps memory and sockets
//! - A slot's concurrency permit is released only after its response handler
//!   has finished
//! - While the pause flag is set, no slot is admitted and no handler runs
//! - Once the abort flag is set, slots that have not started complete
//!   without sending anything

mod control;
mod status;

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub use control::LaunchControl;
use status::{log_status, spawn_status_ticker, LaunchProgress};

use crate::error_handling::{ErrorType, ProcessingStats};
use crate::executor::{execute, RateGate, RequestOutcome, RequestSpec, Transport};
use crate::rate_limiter::{Admission, RateLimiter};

/// Options of one launcher run.
pub struct LaunchOptions<B> {
    /// Label used in log lines
    pub name: String,
    /// Number of slots, ids run from 1 to `count`
    pub count: u64,
    /// Upper bound on slots in flight
    pub max_parallel: usize,
    /// Builds the request of a slot from its id
    pub builder: B,
}

/// What a response handler receives for one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub slot: u64,
    pub status: u16,
    /// Parsed JSON body, `None` when missing or unparseable
    pub body: Option<Value>,
    pub elapsed_ms: u64,
    pub attempts: u32,
    /// Transport error of the final attempt, if any
    pub error: Option<String>,
    /// Retries were cut short by an abort
    pub aborted: bool,
}

impl ResponseEnvelope {
    fn from_outcome(slot: u64, outcome: RequestOutcome, stats: &ProcessingStats) -> Self {
        let body = outcome.body.as_deref().and_then(|text| {
            if text.trim().is_empty() {
                return None;
            }
            match serde_json::from_str(text) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("unable to parse response of slot {} to json: {}", slot, e);
                    stats.increment_error(ErrorType::Parse);
                    None
                }
            }
        });
        Self {
            slot,
            status: outcome.status,
            body,
            elapsed_ms: outcome.elapsed_ms,
            attempts: outcome.attempts,
            error: outcome.error,
            aborted: outcome.aborted,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Totals of one launcher run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSummary {
    /// Slots whose handler ran
    pub completed: u64,
    /// Slots skipped because of an abort
    pub skipped: u64,
    /// Failures of the launcher itself (not of individual requests)
    pub errors: Vec<String>,
}

/// Shared resources every launcher run needs.
#[derive(Clone)]
pub struct Launcher {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    stats: Arc<ProcessingStats>,
}

impl Launcher {
    /// Creates a launcher.
    ///
    /// # Arguments
    ///
    /// * `transport` - Sends the requests
    /// * `limiter` - Admits every attempt, shared across launcher runs
    /// * `stats` - Receives rate-limit and parse error counts
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        stats: Arc<ProcessingStats>,
    ) -> Self {
        Self {
            transport,
            limiter,
            stats,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Runs every slot of `options` and calls `handler` with each response.
    ///
    /// Handlers may run out of slot order. Per-request errors are the
    /// handler's business; the summary only reports launcher failures.
    ///
    /// # Arguments
    ///
    /// * `options` - Slot count, parallelism cap and the per-slot request builder
    /// * `control` - Pause/abort flags, shared with the handler and other callers
    /// * `handler` - Called once per sent slot; the slot's permit is held until it returns
    ///
    /// # Returns
    ///
    /// Returns a `LaunchSummary` with the number of handled and skipped slots.
    pub async fn run<B, H, Fut>(
        &self,
        options: LaunchOptions<B>,
        control: LaunchControl,
        handler: H,
    ) -> LaunchSummary
    where
        B: Fn(u64) -> RequestSpec,
        H: Fn(ResponseEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let LaunchOptions {
            name,
            count,
            max_parallel,
            builder,
        } = options;

        let mut summary = LaunchSummary::default();
        if count == 0 {
            return summary;
        }

        let semaphore = Arc::new(Semaphore::new(max_parallel.clamp(1, Semaphore::MAX_PERMITS)));
        let handler = Arc::new(handler);
        let progress = Arc::new(LaunchProgress::new(count));
        let cancel = CancellationToken::new();
        let ticker = spawn_status_ticker(
            name.clone(),
            Arc::clone(&progress),
            Arc::clone(&self.limiter),
            cancel.child_token(),
        );

        let mut tasks = FuturesUnordered::new();

        for slot in 1..=count {
            if control.is_aborted() {
                summary.skipped = count - slot + 1;
                break;
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!("[{}] semaphore closed, stopping at slot {}", name, slot);
                    summary.errors.push(e.to_string());
                    summary.skipped = count - slot + 1;
                    break;
                }
            };

            if self.limiter.admit(slot, &control).await == Admission::Aborted {
                summary.skipped = count - slot + 1;
                break;
            }

            let spec = builder(slot);
            progress.started.fetch_add(1, Ordering::SeqCst);

            let transport = Arc::clone(&self.transport);
            let limiter = Arc::clone(&self.limiter);
            let stats = Arc::clone(&self.stats);
            let handler = Arc::clone(&handler);
            let progress = Arc::clone(&progress);
            let control = control.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;

                let gate = RateGate::pre_admitted(&limiter, slot, &control);
                let outcome = execute(transport.as_ref(), &spec, Some(gate), Some(&stats)).await;

                // Backpressure: hold the response until the consumer catches up
                control.wait_while_paused().await;

                let envelope = ResponseEnvelope::from_outcome(slot, outcome, &stats);
                handler(envelope).await;
                progress.completed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        while let Some(result) = tasks.next().await {
            if let Err(e) = result {
                warn!("[{}] slot task failed: {}", name, e);
                summary.errors.push(e.to_string());
            }
        }

        cancel.cancel();
        let _ = ticker.await;

        summary.completed = progress.completed.load(Ordering::SeqCst);
        log_status(&name, &progress, &self.limiter).await;
        if summary.skipped > 0 {
            warn!("[{}] aborted, {} slot(s) never sent", name, summary.skipped);
        }
        summary
    }
}
