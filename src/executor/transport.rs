//! The "send one request" primitive and its reqwest implementation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::initialization::Credentials;

/// One HTTP request, independent of the client that sends it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    /// JSON body, if any
    pub body: Option<Value>,
    /// Whole-request limit for `send`; for `stream`, the limit on waiting for
    /// the headers and on each silence between body chunks
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url,
            body: None,
            timeout,
        }
    }

    pub fn post_json(url: Url, body: Value, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            url,
            body: Some(body),
            timeout,
        }
    }
}

/// A fully read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// A response whose body is consumed chunk by chunk.
pub struct StreamingResponse {
    pub status: u16,
    pub chunks: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Network-level failure: no status code was received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// The request ran into its timeout
    pub timeout: bool,
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timeout: false,
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            timeout: true,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            timeout: e.is_timeout(),
            message: e.to_string(),
        }
    }
}

/// Sends requests on behalf of the executor and the backup phases.
///
/// Implementations must not retry; retries belong to the executor.
pub trait Transport: Send + Sync {
    /// Sends a request and reads the whole body.
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;

    /// Sends a request and hands the body back as a stream of chunks.
    fn stream(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'_, Result<StreamingResponse, TransportError>>;
}

/// Production transport over a shared `reqwest::Client`.
///
/// Attaches the current bearer token (if any) to every request. Basic auth
/// credentials embedded in the URL are applied by reqwest itself.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Arc<reqwest::Client>,
    credentials: Credentials,
}

impl ReqwestTransport {
    pub fn new(client: Arc<reqwest::Client>, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
        }
    }

    /// Builds the reqwest request. With `whole_request`, the timeout covers
    /// reading the body too; otherwise the caller bounds each step itself.
    async fn build(&self, request: HttpRequest, whole_request: bool) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .header(ACCEPT, "application/json");
        if whole_request {
            builder = builder.timeout(request.timeout);
        }
        if let Some(body) = request.body {
            builder = builder.json(&body);
        }
        if let Some(token) = self.credentials.token().await {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let response = self.build(request, true).await.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok(HttpResponse { status, body })
        })
    }

    fn stream(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'_, Result<StreamingResponse, TransportError>> {
        Box::pin(async move {
            let timeout = request.timeout;
            let send = self.build(request, false).await.send();
            let response = tokio::time::timeout(timeout, send).await.map_err(|_| {
                TransportError::timed_out("no response headers within the timeout")
            })??;
            let status = response.status().as_u16();
            let chunks = response
                .bytes_stream()
                .map_ok(|chunk| chunk.to_vec())
                .map_err(TransportError::from)
                .boxed();
            Ok(StreamingResponse {
                status,
                chunks: with_idle_timeout(chunks, timeout),
            })
        })
    }
}

/// Fails a chunk stream that stays silent for longer than `idle`.
///
/// A large body may take far longer than `idle` in total; only the gap
/// between two chunks is bounded. The stream ends after the timeout error.
pub fn with_idle_timeout(
    chunks: BoxStream<'static, Result<Vec<u8>, TransportError>>,
    idle: Duration,
) -> BoxStream<'static, Result<Vec<u8>, TransportError>> {
    futures::stream::unfold(Some(chunks), move |state| async move {
        let mut chunks = state?;
        match tokio::time::timeout(idle, chunks.next()).await {
            Ok(Some(item)) => Some((item, Some(chunks))),
            Ok(None) => None,
            Err(_) => Some((
                Err(TransportError::timed_out(format!(
                    "no data received for {} ms",
                    idle.as_millis()
                ))),
                None,
            )),
        }
    })
    .boxed()
}
