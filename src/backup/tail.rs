//! Phase 3: replay the changes made while the backup ran.

use log::{info, warn};
use serde_json::Value;

use super::{classify_failure, write_docs, PhaseContext, SEQUENTIAL_SLOT};
use crate::config::{CHANGES_TIMEOUT, MAX_TAIL_ITERATIONS, MIN_TAIL_BATCH_SIZE};
use crate::couch::{ChangesPage, ChangesQuery};
use crate::error_handling::ErrorType;
use crate::executor::{execute, RateGate, RequestSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TailSummary {
    pub(crate) last_seq: Option<String>,
    pub(crate) iterations: usize,
    /// Documents written
    pub(crate) docs: u64,
    /// The feed still had changes after the last iteration
    pub(crate) gave_up: bool,
}

/// Pages through the changes feed from `since`, writing changed documents.
///
/// Stops once the feed reports nothing pending or returns an empty page, and
/// gives up after a fixed number of pages on a database that keeps changing.
pub(crate) async fn tail_changes(
    ctx: &PhaseContext,
    since: String,
    batch_size: usize,
) -> TailSummary {
    let limit = batch_size.max(MIN_TAIL_BATCH_SIZE) as u64;
    let mut since = since;
    let mut summary = TailSummary::default();

    for iteration in 1..=MAX_TAIL_ITERATIONS {
        if ctx.control.is_aborted() {
            return summary;
        }
        summary.iterations = iteration;

        let query = ChangesQuery {
            since: since.clone(),
            limit: Some(limit),
            seq_interval: None,
            include_docs: true,
        };
        let spec = RequestSpec::new(
            format!("phase 3 #{}", iteration),
            ctx.couch.changes(&query, CHANGES_TIMEOUT),
        );
        let gate = RateGate::new(&ctx.limiter, SEQUENTIAL_SLOT, &ctx.control);
        let outcome = execute(
            ctx.transport.as_ref(),
            &spec,
            Some(gate),
            Some(&ctx.state.stats),
        )
        .await;
        if outcome.aborted {
            return summary;
        }

        let body: Option<Value> = outcome
            .body
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok());
        if !outcome.is_success() {
            let failure = classify_failure(
                "phase 3",
                outcome.status,
                body.as_ref(),
                outcome.error.as_deref(),
            );
            if failure.kind == ErrorType::FatalStore {
                ctx.control.abort();
            }
            ctx.state.record_error(failure);
            return summary;
        }

        let Some(page) = body.and_then(|b| serde_json::from_value::<ChangesPage>(b).ok()) else {
            ctx.state.stats.increment_error(ErrorType::Parse);
            warn!("[phase 3] unable to parse changes response, stopping");
            return summary;
        };

        let docs = page.live_docs();
        if !docs.is_empty() {
            summary.docs += docs.len() as u64;
            if !write_docs(&ctx.sink, &docs) {
                ctx.sink.drained().await;
            }
        }
        if let Some(seq) = page.last_seq_token() {
            since = seq.clone();
            summary.last_seq = Some(seq);
        }
        info!(
            "[phase 3 #{}] changes: {}, docs written: {}, pending: {}",
            iteration,
            page.results.len(),
            docs.len(),
            page.pending
                .map_or_else(|| "?".to_string(), |p| p.to_string())
        );

        if page.pending == Some(0) || page.results.is_empty() {
            return summary;
        }
    }

    warn!(
        "[phase 3] giving up after {} pages, the database is changing faster than it can be tailed",
        MAX_TAIL_ITERATIONS
    );
    summary.gave_up = true;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::test_context;
    use crate::executor::{
        HttpRequest, HttpResponse, StreamingResponse, Transport, TransportError,
    };
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Serves queued changes pages and records the requested URLs.
    struct PagedFeed {
        pages: Mutex<VecDeque<(u16, Value)>>,
        urls: Mutex<Vec<String>>,
    }

    impl PagedFeed {
        fn new(pages: Vec<(u16, Value)>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                urls: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for PagedFeed {
        fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
            self.urls.lock().unwrap().push(request.url.to_string());
            let (status, body) = self
                .pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((200, json!({"results": [], "last_seq": "end", "pending": 0})));
            Box::pin(async move {
                Ok(HttpResponse {
                    status,
                    body: body.to_string(),
                })
            })
        }

        fn stream(
            &self,
            _request: HttpRequest,
        ) -> BoxFuture<'_, Result<StreamingResponse, TransportError>> {
            Box::pin(async { Err(TransportError::new("not used")) })
        }
    }

    fn page(ids: &[&str], last_seq: &str, pending: u64) -> (u16, Value) {
        let results: Vec<Value> = ids
            .iter()
            .map(|id| json!({"id": id, "changes": [{"rev": "1-a"}], "doc": {"_id": id}}))
            .collect();
        (
            200,
            json!({"results": results, "last_seq": last_seq, "pending": pending}),
        )
    }

    #[tokio::test]
    async fn test_tail_pages_until_nothing_pending() {
        let feed = PagedFeed::new(vec![
            page(&["a", "b"], "2-x", 1),
            page(&["c"], "3-x", 0),
        ]);
        let file = tempfile::NamedTempFile::new().unwrap();
        let out = tokio::fs::File::create(file.path()).await.unwrap();
        let ctx = test_context(feed.clone(), out);

        let summary = tail_changes(&ctx, "1-x".to_string(), 0).await;
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.docs, 3);
        assert_eq!(summary.last_seq.as_deref(), Some("3-x"));
        assert!(!summary.gave_up);

        let urls = feed.urls.lock().unwrap().clone();
        assert!(urls[0].contains("since=1-x"));
        assert!(urls[0].contains("limit=100"));
        assert!(urls[0].contains("include_docs=true"));
        assert!(urls[1].contains("since=2-x"));

        let sink = Arc::try_unwrap(ctx.sink).ok().unwrap();
        sink.finish().await.unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents, "[{\"_id\":\"a\"},{\"_id\":\"b\"}]\n[{\"_id\":\"c\"}]\n\n");
    }

    #[tokio::test]
    async fn test_tail_skips_deleted_and_empty_pages() {
        let feed = PagedFeed::new(vec![(
            200,
            json!({
                "results": [{"id": "gone", "deleted": true, "doc": {"_id": "gone", "_deleted": true}}],
                "last_seq": "9-x",
                "pending": 0
            }),
        )]);
        let (writer, _reader) = tokio::io::duplex(1024);
        let ctx = test_context(feed, writer);

        let summary = tail_changes(&ctx, "now".to_string(), 500).await;
        assert_eq!(summary.docs, 0);
        assert_eq!(summary.iterations, 1);
        assert_eq!(ctx.sink.pending_bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_gives_up_on_busy_database() {
        let pages = (0..MAX_TAIL_ITERATIONS)
            .map(|i| page(&["busy"], &format!("{}-x", i), 1000))
            .collect();
        let (writer, mut reader) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut reader, &mut sink).await;
        });
        let ctx = test_context(PagedFeed::new(pages), writer);

        let summary = tail_changes(&ctx, "0".to_string(), 1).await;
        assert!(summary.gave_up);
        assert_eq!(summary.iterations, MAX_TAIL_ITERATIONS);
        assert_eq!(summary.docs, MAX_TAIL_ITERATIONS as u64);
    }

    #[tokio::test]
    async fn test_tail_records_store_error_and_aborts() {
        let feed = PagedFeed::new(vec![(
            404,
            json!({"error": "not_found", "reason": "Database does not exist."}),
        )]);
        let (writer, _reader) = tokio::io::duplex(1024);
        let ctx = test_context(feed, writer);

        let summary = tail_changes(&ctx, "5-x".to_string(), 10).await;
        assert_eq!(summary.docs, 0);
        assert!(ctx.control.is_aborted());
        let errors = ctx.state.take_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_db_does_not_exist());
    }
}
