//! Graceful shutdown handling.

use log::debug;
use tokio_util::sync::CancellationToken;

/// Stops the background tasks that outlive a backup.
///
/// Currently that is only the bearer-token refresh task, which exists when an
/// API key was configured.
pub async fn shutdown_gracefully(token_refresh: Option<CancellationToken>) {
    if let Some(shutdown) = token_refresh {
        debug!("[iam] stopping the token refresh task");
        shutdown.cancel();
    }
    // Let cancelled tasks observe the signal before the runtime goes away
    tokio::task::yield_now().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_refresh() {
        let token = CancellationToken::new();
        shutdown_gracefully(Some(token.clone())).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_without_tasks() {
        shutdown_gracefully(None).await;
    }
}
