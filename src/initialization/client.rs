//! HTTP client initialization.

use std::sync::Arc;
use std::time::Duration;

use reqwest::ClientBuilder;

use crate::config::BackupConfig;

/// Initializes the shared HTTP client.
///
/// Timeouts are set per request (metadata, changes and bulk reads differ), so
/// the client itself only bounds connection setup. The idle pool is sized for
/// the configured number of parallel reads.
///
/// # Errors
///
/// Returns a `reqwest::Error` if client creation fails.
pub fn init_client(config: &BackupConfig) -> Result<Arc<reqwest::Client>, reqwest::Error> {
    let client = ClientBuilder::new()
        .connect_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(config.max_parallel_reads)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_client_with_defaults() {
        assert!(init_client(&BackupConfig::default()).is_ok());
    }
}
