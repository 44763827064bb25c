//! Retrying execution of one logical request.

use futures::future::BoxFuture;
use futures::{FutureExt, TryFutureExt};
use tokio::time::Instant;

use super::delay::RetryDelay;
use super::transport::{HttpRequest, StreamingResponse, Transport, TransportError};
use crate::config::{
    DEFAULT_RETRY_CODES, HTTP_STATUS_INTERNAL_SERVER_ERROR, HTTP_STATUS_REQUEST_TIMEOUT,
    HTTP_STATUS_TOO_MANY_REQUESTS, RETRY_MAX_ATTEMPTS,
};
use crate::error_handling::{ErrorType, ProcessingStats};
use crate::launcher::LaunchControl;
use crate::rate_limiter::{Admission, RateLimiter};
use crate::utils::format::friendly_ms;

/// Which responses are retried and how often.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed for retryable codes other than 429 (first attempt included)
    pub max_attempts: u32,
    /// Codes that trigger a retry. 429 in this list is retried without limit.
    pub retry_codes: Vec<u16>,
    /// Seed for the backoff delay (random when `None`)
    pub initial_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            retry_codes: DEFAULT_RETRY_CODES.to_vec(),
            initial_delay_ms: None,
        }
    }
}

/// A request plus the policy it is executed with.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Short label used in log lines
    pub name: String,
    pub request: HttpRequest,
    pub policy: RetryPolicy,
}

impl RequestSpec {
    pub fn new(name: impl Into<String>, request: HttpRequest) -> Self {
        Self {
            name: name.into(),
            request,
            policy: RetryPolicy::default(),
        }
    }
}

/// Admission gate used when the request runs under a rate limiter.
#[derive(Clone, Copy)]
pub struct RateGate<'a> {
    pub limiter: &'a RateLimiter,
    pub slot: u64,
    pub control: &'a LaunchControl,
    /// The first attempt was already admitted by the caller
    pub admitted: bool,
}

impl<'a> RateGate<'a> {
    pub fn new(limiter: &'a RateLimiter, slot: u64, control: &'a LaunchControl) -> Self {
        Self {
            limiter,
            slot,
            control,
            admitted: false,
        }
    }

    /// Gate whose first attempt already holds admission.
    pub fn pre_admitted(limiter: &'a RateLimiter, slot: u64, control: &'a LaunchControl) -> Self {
        Self {
            admitted: true,
            ..Self::new(limiter, slot, control)
        }
    }
}

/// Terminal result of a logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Final status; 500 or 408 when no response was received
    pub status: u16,
    /// Body of the final response, if one was received
    pub body: Option<String>,
    /// Time from the first admission attempt to the final response
    pub elapsed_ms: u64,
    /// Number of attempts actually sent
    pub attempts: u32,
    /// Transport error of the final attempt, if any
    pub error: Option<String>,
    /// The run was aborted before the request (or its retry) could be sent
    pub aborted: bool,
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Terminal result of a streamed request.
#[derive(Debug)]
pub struct StreamOutcome {
    pub status: u16,
    /// The final response, body still unread
    pub response: Option<StreamingResponse>,
    pub elapsed_ms: u64,
    pub attempts: u32,
    pub error: Option<String>,
    pub aborted: bool,
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes `spec`, retrying according to its policy.
///
/// Network failures are reported as status 408 when they were timeouts and
/// 500 otherwise. 429s feed the limiter's decrease path and are retried
/// without limit; other retryable codes are retried until `max_attempts`.
/// With a gate, every attempt first waits for admission, and an abort stops
/// further attempts.
pub async fn execute(
    transport: &dyn Transport,
    spec: &RequestSpec,
    gate: Option<RateGate<'_>>,
    stats: Option<&ProcessingStats>,
) -> RequestOutcome {
    let (last, meta) = drive(spec, gate, stats, |request| {
        transport
            .send(request)
            .map_ok(|response| (response.status, response.body))
            .boxed()
    })
    .await;
    RequestOutcome {
        status: last.status,
        body: last.payload,
        elapsed_ms: meta.elapsed_ms,
        attempts: meta.attempts,
        error: last.error,
        aborted: meta.aborted,
    }
}

/// Like [`execute`], but hands back the final response with its body unread.
///
/// Retries only cover getting a response; a body that breaks off midway is
/// the caller's to handle.
pub async fn open_stream(
    transport: &dyn Transport,
    spec: &RequestSpec,
    gate: Option<RateGate<'_>>,
    stats: Option<&ProcessingStats>,
) -> StreamOutcome {
    let (last, meta) = drive(spec, gate, stats, |request| {
        transport
            .stream(request)
            .map_ok(|response| (response.status, response))
            .boxed()
    })
    .await;
    StreamOutcome {
        status: last.status,
        response: last.payload,
        elapsed_ms: meta.elapsed_ms,
        attempts: meta.attempts,
        error: last.error,
        aborted: meta.aborted,
    }
}

/// Status plus payload of the last attempt.
struct Attempt<T> {
    status: u16,
    payload: Option<T>,
    error: Option<String>,
}

struct DriveMeta {
    elapsed_ms: u64,
    attempts: u32,
    aborted: bool,
}

async fn drive<'t, T, F>(
    spec: &RequestSpec,
    gate: Option<RateGate<'_>>,
    stats: Option<&ProcessingStats>,
    mut send: F,
) -> (Attempt<T>, DriveMeta)
where
    F: FnMut(HttpRequest) -> BoxFuture<'t, Result<(u16, T), TransportError>>,
{
    let started = Instant::now();
    let mut delay = RetryDelay::seeded(spec.policy.initial_delay_ms);
    let mut attempts: u32 = 0;
    let mut transient_failures: u32 = 0;
    let mut last: Option<Attempt<T>> = None;
    let mut admitted = gate.is_some_and(|gate| gate.admitted);

    let done = |last: Option<Attempt<T>>, attempts: u32, aborted: bool| {
        let last = last.unwrap_or(Attempt {
            status: HTTP_STATUS_INTERNAL_SERVER_ERROR,
            payload: None,
            error: None,
        });
        let meta = DriveMeta {
            elapsed_ms: started.elapsed().as_millis() as u64,
            attempts,
            aborted,
        };
        (last, meta)
    };

    loop {
        if let Some(gate) = gate {
            if !admitted && gate.limiter.admit(gate.slot, gate.control).await == Admission::Aborted
            {
                return done(last, attempts, true);
            }
        }
        admitted = false;

        attempts += 1;
        let attempt = match send(spec.request.clone()).await {
            Ok((status, payload)) => Attempt {
                status,
                payload: Some(payload),
                error: None,
            },
            Err(e) => {
                log::warn!("[{}] unable to reach destination: {}", spec.name, e);
                Attempt {
                    status: if e.timeout {
                        HTTP_STATUS_REQUEST_TIMEOUT
                    } else {
                        HTTP_STATUS_INTERNAL_SERVER_ERROR
                    },
                    payload: None,
                    error: Some(e.message),
                }
            }
        };
        let status = attempt.status;

        if let Some(gate) = gate {
            // Decrease first, so the rate estimate still counts this request
            if status == HTTP_STATUS_TOO_MANY_REQUESTS {
                gate.limiter.on_rate_limited().await;
            } else {
                gate.limiter.on_response().await;
            }
            gate.limiter.finish(gate.slot).await;
        }

        if !spec.policy.retry_codes.contains(&status) {
            return done(Some(attempt), attempts, false);
        }

        let wait = if status == HTTP_STATUS_TOO_MANY_REQUESTS {
            if let Some(stats) = stats {
                stats.increment_error(ErrorType::RateLimit);
            }
            delay.after_rate_limit()
        } else {
            transient_failures += 1;
            if transient_failures >= spec.policy.max_attempts {
                log::warn!(
                    "[{}] {} error, giving up. attempts: {}",
                    spec.name,
                    status,
                    attempts
                );
                return done(Some(attempt), attempts, false);
            }
            delay.after_transient(transient_failures)
        };

        log::debug!(
            "[{}] {} error, trying again in {}",
            spec.name,
            status,
            friendly_ms(wait.as_millis() as f64)
        );
        last = Some(attempt);
        tokio::time::sleep(wait).await;

        if gate.is_some_and(|gate| gate.control.is_aborted()) {
            return done(last, attempts, true);
        }
    }
}
