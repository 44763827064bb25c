// Shared test helpers for mocking a document store.
//
// This module provides the canned responses and the bulk-get responder used by
// the backup integration tests.

use std::path::Path;

use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use rapid_backup::BackupConfig;

pub const DB: &str = "orders";

/// One change entry: `(id, rev, deleted)`.
pub type Change<'a> = (&'a str, &'a str, bool);

/// Renders a `_changes` body the way the store streams it: one entry per line.
pub fn changes_feed(entries: &[Change<'_>], last_seq: &str, pending: u64) -> String {
    let mut body = String::from("{\"results\":[\n");
    for (i, (id, rev, deleted)) in entries.iter().enumerate() {
        let mut entry = json!({
            "seq": format!("{}-seq", i + 1),
            "id": id,
            "changes": [{"rev": rev}],
        });
        if *deleted {
            entry["deleted"] = json!(true);
        }
        body.push_str(&entry.to_string());
        if i + 1 < entries.len() {
            body.push(',');
        }
        body.push('\n');
    }
    body.push_str("],\n");
    body.push_str(&format!(
        "\"last_seq\":\"{}\",\"pending\":{}}}\n",
        last_seq, pending
    ));
    body
}

/// Answers `_bulk_get` with a document for every requested stub.
pub struct BulkGetEcho;

impl Respond for BulkGetEcho {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let results: Vec<Value> = body["docs"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|stub| {
                json!({
                    "id": stub["id"],
                    "docs": [{"ok": {"_id": stub["id"], "_rev": stub["rev"], "backed_up": true}}]
                })
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "results": results }))
    }
}

/// Config pointed at `server`, fast enough for tests.
pub fn config_for(server: &MockServer) -> BackupConfig {
    BackupConfig {
        source_url: server.uri(),
        db_name: DB.to_string(),
        max_rate_per_sec: 100,
        min_rate_per_sec: 50,
        max_parallel_reads: 4,
        read_timeout_ms: 10_000,
        ..Default::default()
    }
}

/// Mounts `GET /{db}`.
pub async fn mount_db_info(server: &MockServer, doc_count: u64, doc_del_count: u64, bytes: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", DB)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "db_name": DB,
            "doc_count": doc_count,
            "doc_del_count": doc_del_count,
            "sizes": {"file": bytes * 2, "external": bytes, "active": bytes}
        })))
        .mount(server)
        .await;
}

/// Mounts the preflight `since=now` request.
pub async fn mount_now_checkpoint(server: &MockServer, seq: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{}/_changes", DB)))
        .and(query_param("since", "now"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "last_seq": seq,
            "pending": 0
        })))
        .mount(server)
        .await;
}

/// Mounts one phase-1 stub page, served for `since`.
pub async fn mount_stub_page(server: &MockServer, since: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(format!("/{}/_changes", DB)))
        .and(query_param("since", since))
        .and(query_param("style", "main_only"))
        .and(wiremock::matchers::query_param_is_missing("include_docs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(server)
        .await;
}

/// Mounts an empty phase-3 tail page for any checkpoint.
pub async fn mount_empty_tail(server: &MockServer, last_seq: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{}/_changes", DB)))
        .and(query_param("include_docs", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "last_seq": last_seq,
            "pending": 0
        })))
        .mount(server)
        .await;
}

/// Reads a backup file and returns its batches.
///
/// Panics unless the file ends with the terminating blank line.
pub fn read_batches(file: &Path) -> Vec<Vec<Value>> {
    let contents = std::fs::read_to_string(file).expect("backup file");
    assert!(contents.ends_with('\n'), "missing trailing newline");
    let body = contents.strip_suffix('\n').unwrap_or(&contents);
    body.lines()
        .map(|line| serde_json::from_str::<Vec<Value>>(line).expect("line is a json array"))
        .collect()
}
