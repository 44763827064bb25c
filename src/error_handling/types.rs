//! Error type definitions.
//!
//! This module defines the typed failures of the backup and the per-request
//! error records collected while it runs.

use log::SetLoggerError;
use reqwest::Error as ReqwestError;
use serde::Serialize;
use strum_macros::EnumIter as EnumIterMacro;
use thiserror::Error;

use crate::config::DB_DOES_NOT_EXIST_REASON;

/// Error types for initialization failures.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)] // All variants end with "Error" by convention
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    LoggerError(#[from] SetLoggerError),

    /// Error initializing the HTTP client.
    #[error("HTTP client initialization error: {0}")]
    HttpClientError(#[from] ReqwestError),

    /// The API key could not be exchanged for a bearer token.
    #[error("Token exchange error: {0}")]
    TokenExchangeError(String),
}

/// Errors that end a backup before or outside the request pipeline.
#[derive(Error, Debug)]
pub enum BackupError {
    /// One or more options are missing or out of range. No request was made.
    #[error("invalid backup options: {}", .0.join("; "))]
    InvalidInput(Vec<String>),

    /// Shared resources (HTTP client, credentials) could not be set up.
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    /// The database info or the starting checkpoint could not be read.
    #[error("preflight failed: {0}")]
    Preflight(String),

    /// The output sink failed.
    #[error("sink error: {0}")]
    Sink(#[from] std::io::Error),
}

/// Categories of problems observed during a backup.
///
/// Every occurrence is counted in [`super::ProcessingStats`]; only some kinds
/// end up in the run's error list (see [`RunError`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, EnumIterMacro)]
pub enum ErrorType {
    /// Options failed validation before any request
    InputValidation,
    /// 408/500 or another retryable code, after retries ran out
    TransientHttp,
    /// 429 received (always retried)
    RateLimit,
    /// The store reported a condition that halts the run
    FatalStore,
    /// A response body or changes line could not be parsed
    Parse,
    /// Final document count differs from the preflight count
    Integrity,
    /// A bulk-get entry came back with an error instead of a document
    DocumentFetch,
    /// Any other non-success response
    HttpStatus,
    /// The stub loop hit its iteration ceiling
    SafetyLimit,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::InputValidation => "Input validation error",
            ErrorType::TransientHttp => "Transient HTTP error",
            ErrorType::RateLimit => "Rate limited (429)",
            ErrorType::FatalStore => "Fatal store error",
            ErrorType::Parse => "Parse error",
            ErrorType::Integrity => "Integrity warning",
            ErrorType::DocumentFetch => "Document fetch error",
            ErrorType::HttpStatus => "HTTP status error",
            ErrorType::SafetyLimit => "Safety limit reached",
        }
    }
}

/// One error recorded during the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub kind: ErrorType,
    /// Launcher slot that produced the error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    /// `reason` field of the store's error body, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunError {
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self {
            kind,
            slot: None,
            status: None,
            message: message.into(),
            reason: None,
        }
    }

    pub fn with_slot(mut self, slot: u64) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    /// True when the store said the database no longer exists.
    pub fn is_db_does_not_exist(&self) -> bool {
        self.reason.as_deref() == Some(DB_DOES_NOT_EXIST_REASON)
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(slot) = self.slot {
            write!(f, " [slot {}]", slot)?;
        }
        if let Some(status) = self.status {
            write!(f, " ({})", status)?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(reason) = &self.reason {
            write!(f, " - {}", reason)?;
        }
        Ok(())
    }
}
