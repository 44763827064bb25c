//! Application configuration and constants.
//!
//! This module provides:
//! - Configuration constants (timeouts, limits, retry policy, etc.)
//! - The library configuration struct and its validation
//! - CLI option types and parsing

mod constants;
mod types;

// Re-export all constants
pub use constants::*;
pub use types::{BackupConfig, LogFormat, LogLevel, Opt};
