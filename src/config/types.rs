//! Configuration types and CLI options.
//!
//! This module defines enums and structs used for command-line argument parsing
//! and configuration.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::constants::*;

/// Logging level for the application.
///
/// Controls the verbosity of log output, from most restrictive (Error) to most
/// verbose (Trace).
#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Error and warning messages
    Warn,
    /// Error, warning, and informational messages
    Info,
    /// All messages except trace
    Debug,
    /// All messages including trace
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted:
/// - `Plain`: Human-readable format with colors (default)
/// - `Json`: Structured JSON format for machine parsing
#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Plain,
    /// Structured JSON format for machine parsing
    Json,
}

/// Library configuration (no CLI dependencies).
///
/// Defaults are applied once here; call [`BackupConfig::validate`] before use.
///
/// # Examples
///
/// ```no_run
/// use rapid_backup::BackupConfig;
///
/// let config = BackupConfig {
///     source_url: "https://couch.example.com".to_string(),
///     db_name: "orders".to_string(),
///     max_rate_per_sec: 20,
///     ..Default::default()
/// };
/// assert!(config.validate().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Base URL of the document store (scheme optional, defaults to https)
    pub source_url: String,

    /// Database to back up
    pub db_name: String,

    /// Target size in bytes of one bulk-get response
    pub batch_get_bytes_goal: u64,

    /// Upper bound on requests per second
    pub max_rate_per_sec: u32,

    /// Upper bound on in-flight bulk reads
    pub max_parallel_reads: usize,

    /// Percent of the detected rate limit left unused, in `[0, 100)`
    pub head_room_percent: f64,

    /// Floor for the allowed request rate
    pub min_rate_per_sec: u32,

    /// Timeout of a single bulk read in milliseconds
    pub read_timeout_ms: u64,

    /// API key exchanged for a bearer token (optional)
    pub bearer_apikey: Option<String>,

    /// Token endpoint used for the API key exchange
    pub iam_token_url: String,

    /// Maximum stubs held in memory per pagination loop
    pub max_stubs_in_memory: usize,

    /// Log level
    pub log_level: LogLevel,

    /// Log format
    pub log_format: LogFormat,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            db_name: String::new(),
            batch_get_bytes_goal: DEFAULT_BATCH_GET_BYTES_GOAL,
            max_rate_per_sec: DEFAULT_MAX_RATE_PER_SEC,
            max_parallel_reads: DEFAULT_MAX_PARALLEL_READS,
            head_room_percent: DEFAULT_HEAD_ROOM_PERCENT,
            min_rate_per_sec: DEFAULT_MIN_RATE_PER_SEC,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            bearer_apikey: None,
            iam_token_url: DEFAULT_IAM_TOKEN_URL.to_string(),
            max_stubs_in_memory: DEFAULT_MAX_STUBS_IN_MEMORY,
            log_level: LogLevel::Info,
            log_format: LogFormat::Plain,
        }
    }
}

impl BackupConfig {
    /// Checks every option and returns all violations (empty when valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.source_url.trim().is_empty() {
            errors.push("\"source_url\" must be a non-empty string".to_string());
        } else if crate::couch::parse_base_url(&self.source_url).is_none() {
            errors.push(format!(
                "\"source_url\" is not a valid url: {}",
                self.source_url
            ));
        }
        if self.db_name.trim().is_empty() {
            errors.push("\"db_name\" must be a non-empty string".to_string());
        }
        if self.batch_get_bytes_goal == 0 {
            errors.push("\"batch_get_bytes_goal\" must be a positive number".to_string());
        }
        if self.max_rate_per_sec == 0 {
            errors.push("\"max_rate_per_sec\" must be a positive number".to_string());
        }
        if self.max_parallel_reads == 0 {
            errors.push("\"max_parallel_reads\" must be a positive number".to_string());
        } else if self.max_parallel_reads > tokio::sync::Semaphore::MAX_PERMITS {
            errors.push(format!(
                "\"max_parallel_reads\" must be <= {}",
                tokio::sync::Semaphore::MAX_PERMITS
            ));
        }
        if self.min_rate_per_sec == 0 {
            errors.push("\"min_rate_per_sec\" must be a positive number".to_string());
        }
        if self.min_rate_per_sec > self.max_rate_per_sec {
            errors.push("\"min_rate_per_sec\" must be <= \"max_rate_per_sec\"".to_string());
        }
        if self.read_timeout_ms == 0 {
            errors.push("\"read_timeout_ms\" must be a positive number".to_string());
        }
        if self.max_stubs_in_memory == 0 {
            errors.push("\"max_stubs_in_memory\" must be a positive number".to_string());
        }
        if !self.head_room_percent.is_finite() {
            errors.push("\"head_room_percent\" must be a number".to_string());
        } else if !(0.0..100.0).contains(&self.head_room_percent) {
            errors.push("\"head_room_percent\" must be >= 0 and < 100".to_string());
        }
        if let Some(key) = &self.bearer_apikey {
            if key.trim().is_empty() {
                errors.push("\"bearer_apikey\" must not be empty when provided".to_string());
            }
        }

        errors
    }
}

/// Command-line options.
///
/// # Examples
///
/// ```bash
/// # Back up a database into a file
/// rapid_backup --source-url https://couch.example.com --db-name orders --output orders.jsonl
///
/// # Push harder against a generous rate limit
/// rapid_backup --source-url couch.example.com --db-name orders --max-rate-per-sec 50 --max-parallel-reads 100
/// ```
#[derive(Debug, Parser)]
#[command(
    name = "rapid_backup",
    about = "Backs up every document of a rate-limited CouchDB-style database."
)]
pub struct Opt {
    /// Base URL of the document store
    #[arg(long, env = "COUCH_URL")]
    pub source_url: String,

    /// Database to back up
    #[arg(long, env = "COUCH_DB_NAME")]
    pub db_name: String,

    /// Output file ("-" writes to stdout)
    #[arg(long, value_parser, default_value = "./_backup_docs.json")]
    pub output: PathBuf,

    /// Target size in bytes of one bulk-get response
    #[arg(long, default_value_t = DEFAULT_BATCH_GET_BYTES_GOAL)]
    pub batch_get_bytes_goal: u64,

    /// Upper bound on requests per second
    #[arg(long, default_value_t = DEFAULT_MAX_RATE_PER_SEC)]
    pub max_rate_per_sec: u32,

    /// Upper bound on in-flight bulk reads
    #[arg(long, default_value_t = DEFAULT_MAX_PARALLEL_READS)]
    pub max_parallel_reads: usize,

    /// Percent of the detected rate limit left unused
    #[arg(long, default_value_t = DEFAULT_HEAD_ROOM_PERCENT)]
    pub head_room_percent: f64,

    /// Floor for the allowed request rate
    #[arg(long, default_value_t = DEFAULT_MIN_RATE_PER_SEC)]
    pub min_rate_per_sec: u32,

    /// Timeout of a single bulk read in milliseconds
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT_MS)]
    pub read_timeout_ms: u64,

    /// API key exchanged for a bearer token
    #[arg(long, env = "BEARER_APIKEY", hide_env_values = true)]
    pub bearer_apikey: Option<String>,

    /// Token endpoint used for the API key exchange
    #[arg(long, env = "IAM_TOKEN_URL", default_value = DEFAULT_IAM_TOKEN_URL)]
    pub iam_token_url: String,

    /// Maximum stubs held in memory per pagination loop
    #[arg(long, default_value_t = DEFAULT_MAX_STUBS_IN_MEMORY)]
    pub max_stubs_in_memory: usize,

    /// Log level: error|warn|info|debug|trace
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log format: plain|json
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,
}

impl From<Opt> for BackupConfig {
    fn from(opt: Opt) -> Self {
        Self {
            source_url: opt.source_url,
            db_name: opt.db_name,
            batch_get_bytes_goal: opt.batch_get_bytes_goal,
            max_rate_per_sec: opt.max_rate_per_sec,
            max_parallel_reads: opt.max_parallel_reads,
            head_room_percent: opt.head_room_percent,
            min_rate_per_sec: opt.min_rate_per_sec,
            read_timeout_ms: opt.read_timeout_ms,
            bearer_apikey: opt.bearer_apikey,
            iam_token_url: opt.iam_token_url,
            max_stubs_in_memory: opt.max_stubs_in_memory,
            log_level: opt.log_level,
            log_format: opt.log_format,
        }
    }
}
