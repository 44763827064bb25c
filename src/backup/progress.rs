//! Progress and ETA reporting for the bulk-fetch phase.

use tokio::time::Instant;

/// How much trust to put in an ETA computed at `percent` complete.
pub fn eta_confidence(percent: f64) -> &'static str {
    if percent < 2.0 {
        "none"
    } else if percent < 50.0 {
        "low"
    } else if percent < 75.0 {
        "high"
    } else {
        "very high"
    }
}

/// Tracks completion against the document count read during preflight.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    expected: u64,
    started_at: Instant,
}

/// One progress reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub percent: f64,
    /// Estimated time left, `None` before anything finished
    pub eta_ms: Option<f64>,
    pub confidence: &'static str,
}

impl ProgressTracker {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            started_at: Instant::now(),
        }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Reading after `finished` documents.
    ///
    /// Percent is capped at 100 since documents written during the run can
    /// push `finished` past the preflight count.
    pub fn report(&self, finished: u64) -> ProgressReport {
        let percent = if self.expected == 0 {
            100.0
        } else {
            (finished as f64 / self.expected as f64 * 100.0).min(100.0)
        };
        let elapsed_ms = self.started_at.elapsed().as_millis() as f64;
        let eta_ms = (finished > 0 && percent > 0.0)
            .then(|| (elapsed_ms / percent * (100.0 - percent)).max(0.0));
        ProgressReport {
            percent,
            eta_ms,
            confidence: eta_confidence(percent),
        }
    }
}
