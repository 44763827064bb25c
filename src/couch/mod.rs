//! Document store client.
//!
//! Request builders and response parsers for the endpoints a backup
//! consumes: database info, `_changes` and `_bulk_get`.

mod changes;
mod types;

use std::time::Duration;

use serde_json::json;
use url::Url;

use crate::executor::HttpRequest;

pub use changes::{parse_change_line, ChangeEntry, ChangeLine, LineSplitter};
pub use types::{
    parse_bulk_get, seq_token, store_error, BulkGetDocs, ChangeRow, ChangesPage, DbInfo, DbSizes,
    DocStub, StoreError,
};

/// Parses the store's base URL, defaulting to `https://` when no scheme is given.
///
/// Returns `None` for anything that is not an http(s) URL with a host.
pub fn parse_base_url(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let url = Url::parse(&with_scheme).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(url)
}

/// Strips credentials from a URL for log output.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    if !redacted.username().is_empty() {
        let _ = redacted.set_username("");
    }
    if redacted.password().is_some() {
        let _ = redacted.set_password(None);
    }
    redacted.to_string()
}

/// Parameters of a `_changes` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesQuery {
    /// Checkpoint to start from (`0` for the beginning, `now` for the end)
    pub since: String,
    pub limit: Option<u64>,
    pub seq_interval: Option<u64>,
    pub include_docs: bool,
}

impl ChangesQuery {
    pub fn since(since: impl Into<String>) -> Self {
        Self {
            since: since.into(),
            ..Default::default()
        }
    }
}

/// Builds requests against one database.
#[derive(Debug, Clone)]
pub struct CouchClient {
    base: Url,
    db_name: String,
}

impl CouchClient {
    /// Returns `None` when `source_url` is not a usable base URL.
    pub fn new(source_url: &str, db_name: &str) -> Option<Self> {
        Some(Self {
            base: parse_base_url(source_url)?,
            db_name: db_name.to_string(),
        })
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Base URL without credentials, for logs.
    pub fn display_base(&self) -> String {
        redact_url(&self.base)
    }

    fn db_url(&self, endpoint: Option<&str>) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        // http(s) URLs always have path segments
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.db_name);
            if let Some(endpoint) = endpoint {
                segments.push(endpoint);
            }
        }
        url
    }

    /// `GET /{db}`
    pub fn db_info(&self, timeout: Duration) -> HttpRequest {
        HttpRequest::get(self.db_url(None), timeout)
    }

    /// `GET /{db}/_changes?style=main_only&since=...`
    pub fn changes(&self, query: &ChangesQuery, timeout: Duration) -> HttpRequest {
        let mut url = self.db_url(Some("_changes"));
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("style", "main_only");
            pairs.append_pair("since", &query.since);
            if let Some(seq_interval) = query.seq_interval {
                pairs.append_pair("seq_interval", &seq_interval.to_string());
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if query.include_docs {
                pairs.append_pair("include_docs", "true");
            }
        }
        HttpRequest::get(url, timeout)
    }

    /// `POST /{db}/_bulk_get` with `{"docs": [{"id", "rev"}, ...]}`
    pub fn bulk_get(&self, stubs: &[DocStub], timeout: Duration) -> HttpRequest {
        let body = json!({ "docs": stubs });
        HttpRequest::post_json(self.db_url(Some("_bulk_get")), body, timeout)
    }
}
