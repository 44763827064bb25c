//! Error handling and processing statistics.
//!
//! This module provides:
//! - Typed failures for initialization and the backup run
//! - Per-request error records and their categories
//! - Processing statistics (one counter per category)
//! - Error ordering for the final report
//!
//! Per-request errors never unwind the pipeline. They are collected and only
//! examined at phase and run boundaries.

mod stats;
mod types;

pub use stats::ProcessingStats;
pub use types::{BackupError, ErrorType, InitializationError, RunError};

/// Moves the first "database does not exist" error to the front of the list.
///
/// Callers scanning the result for a deleted database only need to look at the
/// first entry. Later occurrences keep their relative position.
pub fn order_errors(mut errors: Vec<RunError>) -> Vec<RunError> {
    if let Some(pos) = errors.iter().position(RunError::is_db_does_not_exist) {
        let dne = errors.remove(pos);
        errors.insert(0, dne);
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DB_DOES_NOT_EXIST_REASON;
    use strum::IntoEnumIterator;

    #[test]
    fn test_processing_stats_initialization() {
        let stats = ProcessingStats::new();
        for error_type in ErrorType::iter() {
            assert_eq!(stats.get_error_count(error_type), 0);
        }
        assert_eq!(stats.total_errors(), 0);
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_processing_stats_increment() {
        let stats = ProcessingStats::new();
        stats.increment_error(ErrorType::RateLimit);
        stats.increment_error(ErrorType::RateLimit);
        stats.increment_error(ErrorType::Parse);

        assert_eq!(stats.get_error_count(ErrorType::RateLimit), 2);
        assert_eq!(stats.get_error_count(ErrorType::Parse), 1);
        assert_eq!(stats.total_errors(), 3);
        assert_eq!(
            stats.snapshot(),
            vec![(ErrorType::RateLimit, 2), (ErrorType::Parse, 1)]
        );
    }

    #[test]
    fn test_order_errors_moves_db_does_not_exist_first() {
        let errors = vec![
            RunError::new(ErrorType::TransientHttp, "first").with_slot(1),
            RunError::new(ErrorType::TransientHttp, "second").with_slot(2),
            RunError::new(ErrorType::FatalStore, "not_found")
                .with_slot(3)
                .with_reason(Some(DB_DOES_NOT_EXIST_REASON.to_string())),
        ];
        let ordered = order_errors(errors);
        assert_eq!(ordered[0].slot, Some(3));
        assert_eq!(ordered[1].slot, Some(1));
        assert_eq!(ordered[2].slot, Some(2));
    }

    #[test]
    fn test_order_errors_moves_only_first_db_does_not_exist() {
        let dne = |slot| {
            RunError::new(ErrorType::FatalStore, "not_found")
                .with_slot(slot)
                .with_reason(Some(DB_DOES_NOT_EXIST_REASON.to_string()))
        };
        let errors = vec![
            RunError::new(ErrorType::HttpStatus, "bad request").with_slot(1),
            dne(2),
            RunError::new(ErrorType::TransientHttp, "timeout").with_slot(3),
            dne(4),
        ];
        let slots: Vec<Option<u64>> = order_errors(errors).iter().map(|e| e.slot).collect();
        // The later one stays where it was
        assert_eq!(slots, vec![Some(2), Some(1), Some(3), Some(4)]);
    }

    #[test]
    fn test_order_errors_keeps_order_without_dne() {
        let errors = vec![
            RunError::new(ErrorType::TransientHttp, "a"),
            RunError::new(ErrorType::HttpStatus, "b"),
        ];
        let ordered = order_errors(errors.clone());
        assert_eq!(ordered, errors);
    }
}
