//! Bearer-token credentials and their refresh task.
//!
//! An API key is exchanged once for an access token before the backup starts.
//! A background task then refreshes the token shortly before it expires and
//! republishes it into the shared [`Credentials`] cell that every request reads.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{TOKEN_EXCHANGE_TIMEOUT, TOKEN_REFRESH_MARGIN_SECS, TOKEN_REFRESH_RETRY};
use crate::error_handling::InitializationError;
use crate::utils::format::friendly_ms;

/// Shared cell holding the current bearer token (if any).
#[derive(Clone, Default)]
pub struct Credentials {
    token: Arc<RwLock<Option<String>>>,
}

impl Credentials {
    /// Credentials that never attach a bearer header.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token.into()))),
        }
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn set_token(&self, token: String) {
        *self.token.write().await = Some(token);
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// A freshly exchanged access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

impl TokenGrant {
    /// When to refresh: a few minutes before expiry, never in a tight loop.
    pub fn refresh_after(&self) -> Duration {
        self.expires_in
            .saturating_sub(Duration::from_secs(TOKEN_REFRESH_MARGIN_SECS))
            .max(TOKEN_REFRESH_RETRY)
    }
}

/// Exchanges an API key for an access token at `token_url`.
///
/// # Errors
///
/// Returns `InitializationError::TokenExchangeError` when the request fails,
/// the endpoint answers with an error status, or the body is not a token.
pub async fn exchange_api_key(
    client: &reqwest::Client,
    token_url: &str,
    apikey: &str,
) -> Result<TokenGrant, InitializationError> {
    let body = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("grant_type", "urn:ibm:params:oauth:grant-type:apikey")
        .append_pair("apikey", apikey)
        .finish();

    let response = client
        .post(token_url)
        .timeout(TOKEN_EXCHANGE_TIMEOUT)
        .header(reqwest::header::ACCEPT, "application/json")
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(body)
        .send()
        .await
        .map_err(|e| InitializationError::TokenExchangeError(e.to_string()))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| InitializationError::TokenExchangeError(e.to_string()))?;
    if !status.is_success() {
        return Err(InitializationError::TokenExchangeError(format!(
            "token endpoint returned {}: {}",
            status.as_u16(),
            text
        )));
    }

    let parsed: TokenResponse = serde_json::from_str(&text).map_err(|e| {
        InitializationError::TokenExchangeError(format!("unexpected token response: {}", e))
    })?;
    Ok(TokenGrant {
        access_token: parsed.access_token,
        expires_in: Duration::from_secs(parsed.expires_in),
    })
}

/// Exchanges `apikey` and keeps the token fresh in the background.
///
/// Returns the credentials plus a token that stops the refresh task.
pub async fn init_credentials(
    client: Arc<reqwest::Client>,
    token_url: &str,
    apikey: Option<&str>,
) -> Result<(Credentials, Option<CancellationToken>), InitializationError> {
    let Some(apikey) = apikey else {
        return Ok((Credentials::none(), None));
    };

    info!("[iam] exchanging api key for an access token");
    let grant = exchange_api_key(&client, token_url, apikey).await?;
    let credentials = Credentials::with_token(grant.access_token.clone());
    let shutdown = spawn_token_refresh(
        client,
        token_url.to_string(),
        apikey.to_string(),
        credentials.clone(),
        grant.refresh_after(),
    );
    Ok((credentials, Some(shutdown)))
}

fn spawn_token_refresh(
    client: Arc<reqwest::Client>,
    token_url: String,
    apikey: String,
    credentials: Credentials,
    first_refresh: Duration,
) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        let mut wait = first_refresh;
        loop {
            info!(
                "[iam] will refresh the access token in {}",
                friendly_ms(wait.as_millis() as f64)
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_clone.cancelled() => break,
            }

            wait = match exchange_api_key(&client, &token_url, &apikey).await {
                Ok(grant) => {
                    credentials.set_token(grant.access_token.clone()).await;
                    info!("[iam] stored a refreshed access token");
                    grant.refresh_after()
                }
                Err(e) => {
                    error!("[iam] failed to refresh the access token: {}", e);
                    TOKEN_REFRESH_RETRY
                }
            };
        }
    });

    shutdown
}
