//! Application initialization and resource setup.
//!
//! This module provides functions to initialize the shared resources of a backup:
//! - Logger
//! - HTTP client
//! - Bearer-token credentials (with their refresh task)

mod client;
mod credentials;
mod logger;

pub use client::init_client;
pub use credentials::{exchange_api_key, init_credentials, Credentials, TokenGrant};
pub use logger::init_logger_with;
