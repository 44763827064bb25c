//! End-of-run statistics.

use log::{error, info, warn};
use strum::IntoEnumIterator;

use crate::backup::BackupReport;
use crate::error_handling::{ErrorType, ProcessingStats};
use crate::utils::format::{friendly_bytes, friendly_ms, friendly_number};

/// Prints the per-category counters to the log.
///
/// Counts include problems that were retried away (429s) or skipped (parse
/// errors), so they can be non-zero for a clean run.
pub fn print_error_statistics(error_stats: &ProcessingStats) {
    let total_errors = error_stats.total_errors();
    if total_errors == 0 {
        return;
    }

    info!("Error Counts ({} total):", total_errors);
    for error_type in ErrorType::iter() {
        let count = error_stats.get_error_count(error_type);
        if count > 0 {
            info!("   {}: {}", error_type.as_str(), count);
        }
    }
}

/// Prints a summary of a finished backup.
pub fn print_report(report: &BackupReport) {
    info!(
        "Backed up {} of {} docs (+{} from the changes tail) in {}, {} written",
        friendly_number(report.finished_docs as f64),
        friendly_number(report.expected_docs as f64),
        report.tail_docs,
        friendly_ms(report.elapsed_ms as f64),
        friendly_bytes(report.bytes_written as f64)
    );
    info!(
        "Batch size: {}, loops: {} (estimated {}), last seq: {}",
        report.batch_size,
        report.loops,
        report.estimated_loops,
        report.last_seq.as_deref().unwrap_or("-")
    );
    if report.tail_gave_up {
        warn!(
            "The changes tail stopped after {} pages with changes still pending",
            report.tail_iterations
        );
    }
    if let Some(warning) = &report.integrity_warning {
        warn!("Integrity: {}", warning);
    }

    if !report.error_counts.is_empty() {
        info!("Error Counts:");
        for (error_type, count) in &report.error_counts {
            info!("   {}: {}", error_type.as_str(), count);
        }
    }

    if let Some(errors) = &report.errors {
        error!("{} error(s):", errors.len());
        for e in errors {
            error!("   {}", e);
        }
    }
}
