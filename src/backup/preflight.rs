//! Database stats and the starting checkpoint.

use log::info;
use serde_json::Value;

use crate::config::{CHANGES_TIMEOUT, METADATA_TIMEOUT};
use crate::couch::{seq_token, store_error, ChangesQuery, CouchClient, DbInfo};
use crate::error_handling::{BackupError, ErrorType, ProcessingStats};
use crate::executor::{execute, RequestOutcome, RequestSpec, Transport};
use crate::utils::format::{friendly_bytes, friendly_number};

/// What the backup learns before it starts reading documents.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Preflight {
    pub(crate) info: DbInfo,
    /// Checkpoint of the changes feed when the backup started
    pub(crate) now_seq: String,
    /// Documents per bulk-get request
    pub(crate) batch_size: usize,
    /// Expected number of stub loops, for progress logs only
    pub(crate) estimated_loops: u64,
}

/// Documents per bulk-get request for a byte budget of `bytes_goal`.
///
/// Zero for an empty database, otherwise at least one.
pub(crate) fn compute_batch_size(info: &DbInfo, bytes_goal: u64) -> usize {
    match info.average_doc_bytes() {
        None => 0,
        Some(avg) if avg <= 0.0 => 1,
        Some(avg) => ((bytes_goal as f64 / avg).floor() as usize).max(1),
    }
}

/// `ceil((doc_count + doc_del_count) / max_stubs)`
pub(crate) fn estimate_loops(info: &DbInfo, max_stubs: usize) -> u64 {
    let entries = info.doc_count + info.doc_del_count;
    entries.div_ceil(max_stubs.max(1) as u64)
}

/// Fetches the database info and the "now" checkpoint concurrently.
///
/// # Errors
///
/// Returns `BackupError::Preflight` when either request fails or its body
/// is unusable.
pub(crate) async fn run_preflight(
    transport: &dyn Transport,
    couch: &CouchClient,
    stats: &ProcessingStats,
    bytes_goal: u64,
    max_stubs: usize,
) -> Result<Preflight, BackupError> {
    let info_spec = RequestSpec::new("db info", couch.db_info(METADATA_TIMEOUT));
    let now_spec = RequestSpec::new(
        "checkpoint",
        couch.changes(&ChangesQuery::since("now"), CHANGES_TIMEOUT),
    );

    let (info_outcome, now_outcome) = tokio::join!(
        execute(transport, &info_spec, None, Some(stats)),
        execute(transport, &now_spec, None, Some(stats)),
    );

    let info_body = success_body("unable to get basic db data", &info_outcome, stats)?;
    let info: DbInfo = serde_json::from_value(info_body).map_err(|e| {
        stats.increment_error(ErrorType::Parse);
        BackupError::Preflight(format!("unexpected db info response: {}", e))
    })?;

    let now_body = success_body("unable to get db changes", &now_outcome, stats)?;
    let now_seq = now_body
        .get("last_seq")
        .and_then(seq_token)
        .ok_or_else(|| BackupError::Preflight("changes response has no last_seq".to_string()))?;

    let batch_size = compute_batch_size(&info, bytes_goal);
    let estimated_loops = estimate_loops(&info, max_stubs);

    info!("[stats] size: {}", friendly_bytes(info.total_bytes() as f64));
    info!("[stats] docs: {}", friendly_number(info.doc_count as f64));
    info!("[stats] deleted docs: {}", friendly_number(info.doc_del_count as f64));
    if let Some(avg) = info.average_doc_bytes() {
        info!("[stats] avg doc: {}", friendly_bytes(avg));
    }
    info!("[stats] batch size: {}", batch_size);
    info!("[stats] estimated loops: {}", estimated_loops);

    Ok(Preflight {
        info,
        now_seq,
        batch_size,
        estimated_loops,
    })
}

fn success_body(
    what: &str,
    outcome: &RequestOutcome,
    stats: &ProcessingStats,
) -> Result<Value, BackupError> {
    let parsed: Option<Value> = outcome
        .body
        .as_deref()
        .and_then(|text| serde_json::from_str(text).ok());

    if !outcome.is_success() {
        let detail = match parsed.as_ref().and_then(store_error) {
            Some(e) => format!("{}: {}", e.error, e.reason.unwrap_or_default()),
            None => outcome.error.clone().unwrap_or_default(),
        };
        return Err(BackupError::Preflight(format!(
            "{} (status {}) {}",
            what, outcome.status, detail
        )));
    }

    parsed.ok_or_else(|| {
        stats.increment_error(ErrorType::Parse);
        BackupError::Preflight(format!("{}: response body is not json", what))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::couch::DbSizes;

    fn info(doc_count: u64, doc_del_count: u64, external: u64) -> DbInfo {
        DbInfo {
            doc_count,
            doc_del_count,
            sizes: DbSizes {
                file: Some(external * 2),
                external: Some(external),
            },
        }
    }

    #[test]
    fn test_batch_size_from_byte_goal() {
        // 1000 docs of 1 KiB each, 1 MiB budget
        assert_eq!(compute_batch_size(&info(1000, 0, 1024 * 1000), 1024 * 1024), 1024);
    }

    #[test]
    fn test_batch_size_empty_database() {
        assert_eq!(compute_batch_size(&info(0, 5, 0), 1024 * 1024), 0);
    }

    #[test]
    fn test_batch_size_is_at_least_one() {
        // Docs larger than the budget still go one per request
        assert_eq!(compute_batch_size(&info(2, 0, 10_000_000), 1024), 1);
    }

    #[test]
    fn test_estimate_loops_counts_deleted_entries() {
        assert_eq!(estimate_loops(&info(10, 0, 1), 5), 2);
        assert_eq!(estimate_loops(&info(10, 1, 1), 5), 3);
        assert_eq!(estimate_loops(&info(0, 0, 0), 5), 0);
    }
}
