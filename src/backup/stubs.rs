//! Phase 1: stub enumeration from the changes feed.

use futures::TryStreamExt;
use log::{debug, info, warn};
use serde_json::Value;

use super::{classify_failure, PhaseContext, SEQUENTIAL_SLOT};
use crate::config::RETRY_MAX_ATTEMPTS;
use crate::couch::{parse_change_line, ChangeLine, ChangesQuery, DocStub, LineSplitter};
use crate::error_handling::{ErrorType, ProcessingStats, RunError};
use crate::executor::{open_stream, RateGate, RequestSpec, StreamingResponse, TransportError};

/// Stubs and feed position from one pass over the changes feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StubPage {
    pub(crate) stubs: Vec<DocStub>,
    pub(crate) last_seq: Option<String>,
    pub(crate) pending: Option<u64>,
    /// Change entries seen, deleted ones included
    pub(crate) entries: u64,
    pub(crate) deleted: u64,
    pub(crate) malformed: u64,
}

impl StubPage {
    fn absorb(&mut self, line: &str, stats: &ProcessingStats) {
        match parse_change_line(line) {
            ChangeLine::Change(entry) => {
                self.entries += 1;
                match entry.stub() {
                    Some(stub) => self.stubs.push(stub),
                    None if entry.deleted => self.deleted += 1,
                    None => debug!("[phase 1] change for {} lists no revision", entry.id),
                }
            }
            ChangeLine::Tail { last_seq, pending } => {
                if last_seq.is_some() {
                    self.last_seq = last_seq;
                }
                if pending.is_some() {
                    self.pending = pending;
                }
            }
            ChangeLine::Framing => {}
            ChangeLine::Malformed => {
                self.malformed += 1;
                stats.increment_error(ErrorType::Parse);
                debug!("[phase 1] dropping malformed line: {}", line);
            }
        }
    }
}

/// Reads the stubs of up to `max_stubs` changes after `since`.
///
/// A stream that breaks off midway is read again from the start, up to
/// the retry limit. A failed response is returned as a run error.
pub(crate) async fn collect_stubs(ctx: &PhaseContext, since: &str) -> Result<StubPage, RunError> {
    let limit = ctx.max_stubs as u64;
    let query = ChangesQuery {
        since: since.to_string(),
        limit: Some(limit),
        seq_interval: Some(limit),
        include_docs: false,
    };
    let spec = RequestSpec::new("phase 1", ctx.couch.changes(&query, ctx.read_timeout));

    let mut last_error = None;
    for pass in 1..=RETRY_MAX_ATTEMPTS {
        let gate = RateGate::new(&ctx.limiter, SEQUENTIAL_SLOT, &ctx.control);
        let outcome = open_stream(
            ctx.transport.as_ref(),
            &spec,
            Some(gate),
            Some(&ctx.state.stats),
        )
        .await;

        if outcome.aborted {
            return Ok(StubPage::default());
        }
        let success = outcome.is_success();
        let Some(response) = outcome.response else {
            return Err(classify_failure(
                "phase 1",
                outcome.status,
                None,
                outcome.error.as_deref(),
            ));
        };

        if !success {
            let status = response.status;
            let body = read_error_body(response).await;
            return Err(classify_failure("phase 1", status, body.as_ref(), None));
        }

        match read_stub_stream(response, &ctx.state.stats).await {
            Ok(page) => {
                info!(
                    "[phase 1] stubs: {}, deleted: {}, entries: {}, pending: {}",
                    page.stubs.len(),
                    page.deleted,
                    page.entries,
                    page.pending
                        .map_or_else(|| "?".to_string(), |p| p.to_string())
                );
                return Ok(page);
            }
            Err(e) => {
                warn!(
                    "[phase 1] changes stream broke off (pass {}/{}): {}",
                    pass, RETRY_MAX_ATTEMPTS, e
                );
                ctx.state.stats.increment_error(ErrorType::TransientHttp);
                last_error = Some(e);
            }
        }
    }

    Err(RunError::new(
        ErrorType::TransientHttp,
        format!(
            "phase 1 changes stream failed {} times: {}",
            RETRY_MAX_ATTEMPTS,
            last_error.map(|e| e.message).unwrap_or_default()
        ),
    ))
}

/// Parses a streamed changes response line by line.
async fn read_stub_stream(
    mut response: StreamingResponse,
    stats: &ProcessingStats,
) -> Result<StubPage, TransportError> {
    let mut splitter = LineSplitter::new();
    let mut page = StubPage::default();
    while let Some(chunk) = response.chunks.try_next().await? {
        for line in splitter.push(&chunk) {
            page.absorb(&line, stats);
        }
    }
    if let Some(line) = splitter.finish() {
        page.absorb(&line, stats);
    }
    Ok(page)
}

async fn read_error_body(response: StreamingResponse) -> Option<Value> {
    let chunks: Vec<Vec<u8>> = response.chunks.try_collect().await.ok()?;
    serde_json::from_slice(&chunks.concat()).ok()
}
