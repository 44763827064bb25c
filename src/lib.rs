//! rapid_backup library: rate-limited bulk backup of CouchDB-style databases
//!
//! A backup enumerates document stubs from the changes feed, fetches the
//! documents in parallel `_bulk_get` requests and writes them as
//! newline-delimited JSON arrays. An adaptive limiter backs off when the
//! server answers 429 and creeps back up while it does not.
//!
//! # Example
//!
//! ```no_run
//! use rapid_backup::{run_backup, BackupConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackupConfig {
//!     source_url: "https://couch.example.com".to_string(),
//!     db_name: "orders".to_string(),
//!     max_rate_per_sec: 20,
//!     ..Default::default()
//! };
//!
//! let out = tokio::fs::File::create("orders.backup").await?;
//! let report = run_backup(config, out).await?;
//! println!("Backed up {} docs", report.finished_docs);
//! # Ok(())
//! # }
//! ```
//!
//! # Output format
//!
//! Each line is a JSON array of zero or more documents; a blank line ends the
//! stream. Batches are written in completion order and a document may show
//! up more than once (once from the bulk fetch, again from the changes
//! tail), so consumers should deduplicate by `_id` and `_rev`.
//!
//! # Requirements
//!
//! This library requires a Tokio runtime.

pub mod app;
mod backup;
pub mod config;
pub mod couch;
pub mod error_handling;
pub mod executor;
pub mod initialization;
pub mod launcher;
pub mod rate_limiter;
pub mod sink;
mod utils;

// Re-export public API
pub use backup::{run_backup, run_backup_with, BackupReport, ProgressReport, ProgressTracker};
pub use config::{BackupConfig, LogFormat, LogLevel, Opt};
pub use error_handling::{BackupError, ErrorType, RunError};
pub use executor::{ReqwestTransport, Transport};
