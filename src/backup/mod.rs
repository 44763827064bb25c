//! Backup orchestration.
//!
//! A backup runs through these states:
//! - Preflight: database stats and the "now" checkpoint, fetched concurrently
//! - Loop: read up to `max_stubs_in_memory` stubs from the changes feed, then
//!   fetch their documents through the launcher, until the feed reports
//!   nothing pending
//! - Tail: replay the changes that happened while the loop ran
//! - Drain: terminate, flush and close the output
//!
//! Per-request failures are collected in the run's error list; only a fatal
//! store error (e.g. the database was deleted) stops the run early, and even
//! then the output is closed cleanly.

mod fetch;
mod preflight;
mod progress;
mod stubs;
mod tail;

pub use progress::{eta_confidence, ProgressReport, ProgressTracker};

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::time::Instant;

use crate::app::shutdown_gracefully;
use crate::config::{BackupConfig, DEFAULT_RETRY_CODES, MAX_STUB_EQUIVALENTS, MIN_TAIL_BATCH_SIZE};
use crate::couch::{store_error, CouchClient};
use crate::error_handling::{
    order_errors, BackupError, ErrorType, InitializationError, ProcessingStats, RunError,
};
use crate::executor::{ReqwestTransport, Transport};
use crate::initialization::{init_client, init_credentials};
use crate::launcher::{LaunchControl, Launcher};
use crate::rate_limiter::{LimiterSettings, RateLimiter};
use crate::sink::SinkWriter;
use crate::utils::format::friendly_ms;

/// Limiter slot used by the sequential (non-launcher) requests.
///
/// Launcher slots start at 1 and phases never overlap, so ids stay unique.
const SEQUENTIAL_SLOT: u64 = 0;

/// Result of a finished backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    /// Ordered error list, `None` when the run was clean
    pub errors: Option<Vec<RunError>>,
    /// Documents written by the bulk-fetch phase
    pub finished_docs: u64,
    /// Document count reported by the database before the backup started
    pub expected_docs: u64,
    /// Documents written while tailing the changes feed
    pub tail_docs: u64,
    pub tail_iterations: usize,
    /// Tailing stopped with changes still pending
    pub tail_gave_up: bool,
    /// Set when `finished_docs` does not match `expected_docs`
    pub integrity_warning: Option<String>,
    pub batch_size: usize,
    pub loops: u64,
    pub estimated_loops: u64,
    /// Last checkpoint read from the changes feed
    pub last_seq: Option<String>,
    pub bytes_written: u64,
    pub completed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Occurrences per category, including retried and skipped problems
    pub error_counts: Vec<(ErrorType, usize)>,
}

impl BackupReport {
    /// True when no error was recorded (integrity warnings do not count).
    pub fn is_clean(&self) -> bool {
        self.errors.is_none()
    }
}

/// Error list and counters shared by every phase.
pub(crate) struct RunState {
    errors: Mutex<Vec<RunError>>,
    finished_docs: AtomicU64,
    pub(crate) stats: Arc<ProcessingStats>,
}

impl RunState {
    pub(crate) fn new(stats: Arc<ProcessingStats>) -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            finished_docs: AtomicU64::new(0),
            stats,
        }
    }

    /// Counts and keeps `err` for the final report.
    pub(crate) fn record_error(&self, err: RunError) {
        error!("{}", err);
        self.stats.increment_error(err.kind);
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err);
    }

    /// Adds `docs` to the running total and returns the new total.
    pub(crate) fn add_finished(&self, docs: u64) -> u64 {
        self.finished_docs.fetch_add(docs, Ordering::SeqCst) + docs
    }

    pub(crate) fn finished(&self) -> u64 {
        self.finished_docs.load(Ordering::SeqCst)
    }

    fn take_errors(&self) -> Vec<RunError> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Everything a phase needs, built once after preflight.
pub(crate) struct PhaseContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) couch: CouchClient,
    pub(crate) launcher: Launcher,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) control: LaunchControl,
    pub(crate) state: Arc<RunState>,
    pub(crate) sink: Arc<SinkWriter>,
    pub(crate) progress: ProgressTracker,
    pub(crate) read_timeout: Duration,
    pub(crate) max_parallel: usize,
    pub(crate) max_stubs: usize,
}

/// Turns a failed (or store-error) response into a run error.
///
/// Retryable codes that ran out of attempts are transient. Any other
/// response carrying a store error body is fatal to the run.
pub(crate) fn classify_failure(
    what: &str,
    status: u16,
    body: Option<&Value>,
    transport_error: Option<&str>,
) -> RunError {
    let store = body.and_then(store_error);
    let retryable = DEFAULT_RETRY_CODES.contains(&status);

    let detail = match (&store, transport_error) {
        (Some(e), _) => e.error.clone(),
        (None, Some(msg)) => msg.to_string(),
        (None, None) => "unexpected response".to_string(),
    };
    let message = format!("{} failed with status {}: {}", what, status, detail);

    let (kind, reason) = match store {
        _ if retryable => (ErrorType::TransientHttp, None),
        Some(e) => (ErrorType::FatalStore, e.reason),
        None => (ErrorType::HttpStatus, None),
    };
    RunError::new(kind, message)
        .with_status(status)
        .with_reason(reason)
}

/// Pauses the launcher until the sink has written everything it holds.
pub(crate) fn apply_backpressure(sink: &SinkWriter, control: &LaunchControl) {
    if control.is_paused() {
        return;
    }
    warn!(
        "[write] output buffer is full ({} bytes queued), pausing requests",
        sink.pending_bytes()
    );
    control.pause();
    let drained = sink.drained();
    let control = control.clone();
    tokio::spawn(async move {
        drained.await;
        info!("[write] output drained, resuming requests");
        control.resume();
    });
}

/// Serializes `docs` as one output line.
///
/// Returns the sink's verdict: `false` means the caller should back off.
pub(crate) fn write_docs(sink: &SinkWriter, docs: &[Value]) -> bool {
    match serde_json::to_string(docs) {
        Ok(line) => sink.write(line),
        Err(e) => {
            error!("[write] unable to serialize {} docs: {}", docs.len(), e);
            true
        }
    }
}

/// Runs a complete backup of `config.db_name` into `writer`.
///
/// Sets up the HTTP client and (optionally) bearer credentials, then runs
/// the backup. The token refresh task is stopped before returning.
///
/// # Arguments
///
/// * `config` - Source database, rate limits, parallelism and timeouts
/// * `writer` - Destination of the backup lines (file, stdout, pipe)
///
/// # Returns
///
/// Returns a `BackupReport` with document counts, the last checkpoint and
/// every request failure recorded during the run.
///
/// # Errors
///
/// This function will return an error if:
/// - The options are invalid (nothing is sent)
/// - The HTTP client or the bearer token cannot be set up
/// - Preflight fails
/// - The output cannot be written
///
/// Request failures during the run are reported in [`BackupReport::errors`].
pub async fn run_backup<W>(config: BackupConfig, writer: W) -> Result<BackupReport, BackupError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(BackupError::InvalidInput(problems));
    }

    let client = init_client(&config).map_err(InitializationError::from)?;
    let (credentials, refresh) = init_credentials(
        Arc::clone(&client),
        &config.iam_token_url,
        config.bearer_apikey.as_deref(),
    )
    .await?;
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(client, credentials));

    let result = run_backup_with(config, transport, writer).await;
    shutdown_gracefully(refresh).await;
    result
}

/// Runs a backup over an existing transport.
///
/// # Arguments
///
/// * `config` - Source database, rate limits, parallelism and timeouts
/// * `transport` - Sends every request of the run (retries are added on top)
/// * `writer` - Destination of the backup lines
///
/// # Returns
///
/// Returns a `BackupReport`, as [`run_backup`] does.
///
/// # Errors
///
/// Same as [`run_backup`], minus initialization.
pub async fn run_backup_with<W>(
    config: BackupConfig,
    transport: Arc<dyn Transport>,
    writer: W,
) -> Result<BackupReport, BackupError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(BackupError::InvalidInput(problems));
    }
    let couch = CouchClient::new(&config.source_url, &config.db_name).ok_or_else(|| {
        BackupError::InvalidInput(vec![format!("invalid source_url: {}", config.source_url)])
    })?;

    let started = Instant::now();
    info!(
        "[backup] starting backup of \"{}\" from {}",
        couch.db_name(),
        couch.display_base()
    );

    let stats = Arc::new(ProcessingStats::new());
    let pre = preflight::run_preflight(
        transport.as_ref(),
        &couch,
        &stats,
        config.batch_get_bytes_goal,
        config.max_stubs_in_memory,
    )
    .await?;

    let limiter = Arc::new(RateLimiter::new(LimiterSettings::new(
        config.max_rate_per_sec,
        config.min_rate_per_sec,
        config.head_room_percent,
    )));
    limiter.set_rate_modifier(pre.batch_size.max(1) as f64).await;

    let ctx = PhaseContext {
        launcher: Launcher::new(
            Arc::clone(&transport),
            Arc::clone(&limiter),
            Arc::clone(&stats),
        ),
        transport,
        couch,
        limiter,
        control: LaunchControl::new(),
        state: Arc::new(RunState::new(Arc::clone(&stats))),
        sink: Arc::new(SinkWriter::new(writer)),
        progress: ProgressTracker::new(pre.info.doc_count),
        read_timeout: Duration::from_millis(config.read_timeout_ms),
        max_parallel: config.max_parallel_reads,
        max_stubs: config.max_stubs_in_memory,
    };

    let (loops, checkpoint) = run_stub_loop(&ctx, &pre).await;

    let tail = if ctx.control.is_aborted() {
        warn!("[phase 3] skipped, the backup was aborted");
        tail::TailSummary::default()
    } else {
        let since = checkpoint.clone().unwrap_or_else(|| pre.now_seq.clone());
        tail::tail_changes(&ctx, since, pre.batch_size).await
    };
    let last_seq = tail.last_seq.clone().or(checkpoint);

    // Drain
    info!("[write] ending write stream");
    let PhaseContext { sink, state, .. } = ctx;
    let sink = Arc::try_unwrap(sink)
        .map_err(|_| BackupError::Sink(io::Error::other("output is still in use")))?;
    let bytes_written = sink.finish().await?;

    let finished_docs = state.finished();
    let integrity_warning = (finished_docs != pre.info.doc_count).then(|| {
        stats.increment_error(ErrorType::Integrity);
        let msg = format!(
            "backed up {} docs but the database reported {} at the start",
            finished_docs, pre.info.doc_count
        );
        warn!("[fin] {}", msg);
        msg
    });

    let errors = order_errors(state.take_errors());
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if errors.is_empty() {
        info!("[fin] doc backup complete in {}", friendly_ms(elapsed_ms as f64));
    } else {
        error!("[fin] doc backup stopped with {} error(s)", errors.len());
    }

    Ok(BackupReport {
        errors: (!errors.is_empty()).then_some(errors),
        finished_docs,
        expected_docs: pre.info.doc_count,
        tail_docs: tail.docs,
        tail_iterations: tail.iterations,
        tail_gave_up: tail.gave_up,
        integrity_warning,
        batch_size: pre.batch_size,
        loops,
        estimated_loops: pre.estimated_loops,
        last_seq,
        bytes_written,
        completed_at: Utc::now(),
        elapsed_ms,
        error_counts: stats.snapshot(),
    })
}

/// Alternates stub collection and bulk fetching until the feed is drained.
///
/// Returns the number of iterations and the last checkpoint seen.
async fn run_stub_loop(ctx: &PhaseContext, pre: &preflight::Preflight) -> (u64, Option<String>) {
    let mut since = "0".to_string();
    let mut checkpoint: Option<String> = None;
    let mut loops: u64 = 0;

    while !ctx.control.is_aborted() {
        if loops.saturating_mul(ctx.max_stubs as u64) >= MAX_STUB_EQUIVALENTS {
            ctx.state.record_error(RunError::new(
                ErrorType::SafetyLimit,
                format!(
                    "stopped after {} loops, the changes feed did not run dry",
                    loops
                ),
            ));
            break;
        }
        loops += 1;
        info!(
            "[loop {}/~{}] collecting stubs since {}",
            loops,
            pre.estimated_loops.max(1),
            since
        );

        let page = match stubs::collect_stubs(ctx, &since).await {
            Ok(page) => page,
            Err(failure) => {
                if failure.kind == ErrorType::FatalStore {
                    ctx.control.abort();
                }
                ctx.state.record_error(failure);
                break;
            }
        };

        let advanced = page.last_seq.as_ref().is_some_and(|seq| *seq != since);
        if let Some(seq) = &page.last_seq {
            since = seq.clone();
            checkpoint = Some(seq.clone());
        }

        if !page.stubs.is_empty() {
            let batch_size = if pre.batch_size == 0 {
                MIN_TAIL_BATCH_SIZE
            } else {
                pre.batch_size
            };
            fetch::fetch_docs(ctx, page.stubs, batch_size).await;
        }

        let more = match page.pending {
            Some(pending) => pending > 0,
            None => page.entries >= ctx.max_stubs as u64,
        };
        if !more {
            break;
        }
        if !advanced && page.entries == 0 {
            warn!("[loop {}] changes feed did not advance, stopping", loops);
            break;
        }
    }

    (loops, checkpoint)
}

#[cfg(test)]
pub(crate) fn test_context<W>(transport: Arc<dyn Transport>, writer: W) -> PhaseContext
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let stats = Arc::new(ProcessingStats::new());
    let limiter = Arc::new(RateLimiter::new(LimiterSettings::new(1000, 1000, 0.0)));
    PhaseContext {
        launcher: Launcher::new(
            Arc::clone(&transport),
            Arc::clone(&limiter),
            Arc::clone(&stats),
        ),
        transport,
        couch: CouchClient::new("http://couch.test", "db").expect("valid url"),
        limiter,
        control: LaunchControl::new(),
        state: Arc::new(RunState::new(stats)),
        sink: Arc::new(SinkWriter::new(writer)),
        progress: ProgressTracker::new(0),
        read_timeout: Duration::from_secs(5),
        max_parallel: 4,
        max_stubs: 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DB_DOES_NOT_EXIST_REASON;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_classify_db_does_not_exist_is_fatal() {
        let body = json!({"error": "not_found", "reason": DB_DOES_NOT_EXIST_REASON});
        let failure = classify_failure("phase 2", 404, Some(&body), None);
        assert_eq!(failure.kind, ErrorType::FatalStore);
        assert_eq!(failure.status, Some(404));
        assert!(failure.is_db_does_not_exist());
    }

    #[test]
    fn test_classify_retryable_status_is_transient() {
        let body = json!({"error": "internal_server_error"});
        let failure = classify_failure("phase 2", 500, Some(&body), None);
        assert_eq!(failure.kind, ErrorType::TransientHttp);

        let failure = classify_failure("phase 2", 408, None, Some("timed out"));
        assert_eq!(failure.kind, ErrorType::TransientHttp);
        assert!(failure.message.contains("timed out"));
    }

    #[test]
    fn test_classify_plain_status() {
        let failure = classify_failure("phase 1", 502, None, None);
        assert_eq!(failure.kind, ErrorType::HttpStatus);
        assert_eq!(failure.reason, None);
    }

    #[test]
    fn test_run_state_records_and_counts() {
        let stats = Arc::new(ProcessingStats::new());
        let state = RunState::new(Arc::clone(&stats));
        state.record_error(RunError::new(ErrorType::HttpStatus, "a"));
        assert_eq!(state.add_finished(3), 3);
        assert_eq!(state.add_finished(2), 5);

        assert_eq!(stats.get_error_count(ErrorType::HttpStatus), 1);
        assert_eq!(state.take_errors().len(), 1);
        assert!(state.take_errors().is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_pauses_until_drained() {
        let (writer, mut reader) = tokio::io::duplex(8);
        let sink = SinkWriter::with_high_water_mark(writer, 4);
        let control = LaunchControl::new();

        let accepted = write_docs(&sink, &[json!({"_id": "a"})]);
        assert!(!accepted);
        apply_backpressure(&sink, &control);
        assert!(control.is_paused());

        let mut buf = vec![0u8; 14];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"[{\"_id\":\"a\"}]\n");

        tokio::time::timeout(Duration::from_secs(5), async {
            while control.is_paused() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
