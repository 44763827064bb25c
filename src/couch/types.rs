//! Response shapes of the document store endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `GET /{db}` response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DbInfo {
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default)]
    pub doc_del_count: u64,
    #[serde(default)]
    pub sizes: DbSizes,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DbSizes {
    pub file: Option<u64>,
    pub external: Option<u64>,
}

impl DbInfo {
    /// Size of the document bodies, falling back to the file size.
    pub fn total_bytes(&self) -> u64 {
        self.sizes.external.or(self.sizes.file).unwrap_or(0)
    }

    /// Average document size, `None` for an empty database.
    pub fn average_doc_bytes(&self) -> Option<f64> {
        if self.doc_count == 0 {
            None
        } else {
            Some(self.total_bytes() as f64 / self.doc_count as f64)
        }
    }
}

/// One document revision to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocStub {
    pub id: String,
    pub rev: String,
}

/// Error body returned by the store (`{"error": ..., "reason": ...}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub error: String,
    pub reason: Option<String>,
}

/// Extracts the store's error object from a response body, if it is one.
pub fn store_error(body: &Value) -> Option<StoreError> {
    let error = body.get("error")?;
    let error = match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let reason = body
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(StoreError { error, reason })
}

/// Documents and per-entry failures of a `_bulk_get` response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkGetDocs {
    pub docs: Vec<Value>,
    /// Entries that came back with an `error` object instead of `ok`
    pub failed: Vec<Value>,
}

/// Collects `results[].docs[0].ok` from a `_bulk_get` response.
pub fn parse_bulk_get(body: &Value) -> BulkGetDocs {
    let mut parsed = BulkGetDocs::default();
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return parsed;
    };
    for result in results {
        let Some(first) = result
            .get("docs")
            .and_then(Value::as_array)
            .and_then(|docs| docs.first())
        else {
            continue;
        };
        if let Some(doc) = first.get("ok") {
            parsed.docs.push(doc.clone());
        } else if let Some(error) = first.get("error") {
            parsed.failed.push(error.clone());
        }
    }
    parsed
}

/// Renders an opaque sequence token as a query-string value.
///
/// Older servers use integers, newer ones strings.
pub fn seq_token(seq: &Value) -> Option<String> {
    match seq {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// One row of a non-streamed changes response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeRow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Value>,
}

/// A changes response read in one piece (used when tailing).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangesPage {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    #[serde(default)]
    pub last_seq: Value,
    pub pending: Option<u64>,
}

impl ChangesPage {
    pub fn last_seq_token(&self) -> Option<String> {
        seq_token(&self.last_seq)
    }

    /// Bodies of the changed documents, deleted ones excluded.
    pub fn live_docs(&self) -> Vec<Value> {
        self.results
            .iter()
            .filter(|row| !row.deleted)
            .filter_map(|row| row.doc.as_ref())
            .filter(|doc| !doc.get("_deleted").and_then(Value::as_bool).unwrap_or(false))
            .cloned()
            .collect()
    }
}
