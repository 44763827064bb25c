//! Main application modules.
//!
//! This module provides shutdown handling and end-of-run statistics used by
//! the backup and the CLI.

pub mod shutdown;
pub mod statistics;

// Re-export public API
pub use shutdown::shutdown_gracefully;
pub use statistics::{print_error_statistics, print_report};
