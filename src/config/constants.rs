//! Configuration constants.
//!
//! This module defines the defaults and operational limits used throughout the
//! backup: rate limiter timings, retry policy, batching and phase ceilings.

use std::time::Duration;

// Defaults for the recognized configuration options
/// Target bytes per bulk-get request (1 MiB)
pub const DEFAULT_BATCH_GET_BYTES_GOAL: u64 = 1024 * 1024;
/// Upper bound on requests per second
pub const DEFAULT_MAX_RATE_PER_SEC: u32 = 10;
/// Upper bound on in-flight requests.
/// This can be much higher than the rate, the limiter does the real throttling.
pub const DEFAULT_MAX_PARALLEL_READS: usize = 30;
/// Share of the detected rate limit deliberately left unused
pub const DEFAULT_HEAD_ROOM_PERCENT: f64 = 20.0;
/// Floor for the allowed request rate
pub const DEFAULT_MIN_RATE_PER_SEC: u32 = 2;
/// Timeout for bulk reads (2 minutes)
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 2 * 60 * 1000;
/// Maximum number of stubs held in memory before phase 2 must drain them
pub const DEFAULT_MAX_STUBS_IN_MEMORY: usize = 5_000_000;
/// Token endpoint used to exchange an API key for a bearer token
pub const DEFAULT_IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";

// Metadata and changes-feed timeouts
/// Timeout for the database info request
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for a changes-feed request
pub const CHANGES_TIMEOUT: Duration = Duration::from_secs(90);
/// Timeout for the token exchange request
pub const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);
/// Refresh the bearer token this long before it expires
pub const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;
/// Wait before retrying a failed token refresh, and the shortest refresh delay
pub const TOKEN_REFRESH_RETRY: Duration = Duration::from_secs(30);

// Rate limiter timing
/// How often a waiting slot re-checks admission
pub const ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How often a finished slot re-checks the pause flag
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Window used to compute the observed request rate
pub const RATE_WINDOW: Duration = Duration::from_secs(1);
/// After a decrease, further decreases are ignored for this long
pub const DECREASE_DEBOUNCE: Duration = Duration::from_secs(5);
/// After a 429, increases are suppressed for this long
pub const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60 * 60);
/// Minimum spacing between two increases of the allowed rate
pub const INCREASE_COOLDOWN: Duration = Duration::from_secs(10);

// Retry strategy
/// Maximum attempts for retryable non-429 codes (initial attempt included)
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
/// Codes retried by default. 429 is retried without an attempt limit.
pub const DEFAULT_RETRY_CODES: &[u16] = &[429, 408, 500];
/// Lower bound of the randomly seeded base delay
pub const RETRY_SEED_MIN_MS: u64 = 500;
/// Upper bound of the randomly seeded base delay
pub const RETRY_SEED_MAX_MS: u64 = 2000;
/// Growth factor of the delay on each 429
pub const RATE_LIMIT_BACKOFF_FACTOR: f64 = 1.75;
/// Linear step of the delay for other retryable codes
pub const RETRY_LINEAR_STEP_MS: u64 = 500;
/// Jitter added to the linear delay
pub const RETRY_JITTER_MS: u64 = 1500;
/// No retry ever waits longer than this
pub const RETRY_MAX_DELAY_MS: u64 = 60 * 1000;

// Backup phases
/// Hard ceiling on stub-equivalents scanned by the pagination loop
pub const MAX_STUB_EQUIVALENTS: u64 = 100_000_000;
/// Maximum number of tail-changes iterations before giving up
pub const MAX_TAIL_ITERATIONS: usize = 50;
/// Smallest page size used when tailing the changes feed
pub const MIN_TAIL_BATCH_SIZE: usize = 100;
/// Sink buffer size above which `write` reports backpressure
pub const SINK_HIGH_WATER_MARK: usize = 16 * 1024 * 1024;

// Logging
/// Launcher status log interval
pub const LAUNCHER_STATUS_INTERVAL: Duration = Duration::from_secs(5);

// HTTP status codes (for clarity and consistency)
pub const HTTP_STATUS_REQUEST_TIMEOUT: u16 = 408;
pub const HTTP_STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const HTTP_STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

/// Reason string the store returns when the database is gone
pub const DB_DOES_NOT_EXIST_REASON: &str = "Database does not exist.";
