//! Phase 2: bulk document fetch through the launcher.

use std::sync::Arc;

use log::{debug, info, warn};

use super::{
    apply_backpressure, classify_failure, write_docs, PhaseContext, ProgressTracker, RunState,
};
use crate::couch::{parse_bulk_get, store_error, BulkGetDocs, DocStub};
use crate::error_handling::ErrorType;
use crate::executor::RequestSpec;
use crate::launcher::{LaunchControl, LaunchOptions, LaunchSummary, ResponseEnvelope};
use crate::sink::SinkWriter;
use crate::utils::format::friendly_ms;

/// Fetches the documents of `stubs`, `batch_size` per request.
///
/// Every successful response is written to the sink as one line, in
/// completion order.
pub(crate) async fn fetch_docs(
    ctx: &PhaseContext,
    stubs: Vec<DocStub>,
    batch_size: usize,
) -> LaunchSummary {
    let batch_size = batch_size.max(1);
    let stubs = Arc::new(stubs);
    let count = stubs.len().div_ceil(batch_size) as u64;
    info!(
        "[phase 2] fetching {} docs in {} requests of up to {}",
        stubs.len(),
        count,
        batch_size
    );

    let builder = {
        let stubs = Arc::clone(&stubs);
        let couch = ctx.couch.clone();
        let timeout = ctx.read_timeout;
        move |slot: u64| {
            let start = ((slot - 1) as usize * batch_size).min(stubs.len());
            let end = (start + batch_size).min(stubs.len());
            RequestSpec::new(
                format!("phase 2 #{}", slot),
                couch.bulk_get(&stubs[start..end], timeout),
            )
        }
    };

    let handler = {
        let state = Arc::clone(&ctx.state);
        let sink = Arc::clone(&ctx.sink);
        let control = ctx.control.clone();
        let progress = ctx.progress.clone();
        move |envelope: ResponseEnvelope| {
            handle_bulk_response(envelope, &state, &sink, &control, &progress);
            std::future::ready(())
        }
    };

    let options = LaunchOptions {
        name: "phase 2".to_string(),
        count,
        max_parallel: ctx.max_parallel,
        builder,
    };
    let summary = ctx.launcher.run(options, ctx.control.clone(), handler).await;
    for e in &summary.errors {
        warn!("[phase 2] launcher error: {}", e);
    }
    summary
}

fn handle_bulk_response(
    envelope: ResponseEnvelope,
    state: &RunState,
    sink: &SinkWriter,
    control: &LaunchControl,
    progress: &ProgressTracker,
) {
    if envelope.aborted {
        debug!("[phase 2 #{}] dropped after abort", envelope.slot);
        return;
    }

    let store_failed = envelope.body.as_ref().and_then(store_error).is_some();
    if !envelope.is_success() || store_failed {
        let failure = classify_failure(
            "phase 2",
            envelope.status,
            envelope.body.as_ref(),
            envelope.error.as_deref(),
        )
        .with_slot(envelope.slot);
        if failure.kind == ErrorType::FatalStore {
            warn!("[phase 2] store error, stopping all requests");
            control.abort();
        }
        state.record_error(failure);
        return;
    }

    let Some(body) = envelope.body else {
        // Already counted as a parse error by the launcher
        warn!("[phase 2 #{}] response body is not json, skipping", envelope.slot);
        return;
    };

    let BulkGetDocs { docs, failed } = parse_bulk_get(&body);
    for entry in &failed {
        state.stats.increment_error(ErrorType::DocumentFetch);
        warn!("[phase 2 #{}] unable to fetch a doc: {}", envelope.slot, entry);
    }

    let finished = state.add_finished(docs.len() as u64);
    let report = progress.report(finished);
    info!(
        "[phase 2 #{}] docs: {}, response: {}, total: {}/{} ({:.1}%), eta: {} ({} confidence)",
        envelope.slot,
        docs.len(),
        friendly_ms(envelope.elapsed_ms as f64),
        finished,
        progress.expected(),
        report.percent,
        report
            .eta_ms
            .map_or_else(|| "-".to_string(), friendly_ms),
        report.confidence
    );

    if !write_docs(sink, &docs) {
        apply_backpressure(sink, control);
    }
}
