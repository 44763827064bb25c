//! Retrying request execution.
//!
//! This module provides:
//! - The [`Transport`] seam and its reqwest implementation
//! - Retry delays (exponential on 429, linear with jitter otherwise)
//! - [`execute`], which drives one logical request to a terminal outcome
//! - [`open_stream`], the same for a response read as a stream

mod delay;
mod request;
mod transport;

pub use request::{
    execute, open_stream, RateGate, RequestOutcome, RequestSpec, RetryPolicy, StreamOutcome,
};
pub use transport::{
    with_idle_timeout, HttpRequest, HttpResponse, ReqwestTransport, StreamingResponse, Transport,
    TransportError,
};
