//! Sliding window of request start times.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Tracks when each in-flight request started.
///
/// `recent` only keeps requests that started inside the window and have not
/// finished yet; its size is both the admission count and the observed rate.
/// `pending` keeps every request that has not finished, regardless of age.
#[derive(Debug)]
pub(crate) struct InFlightWindow {
    recent: HashMap<u64, Instant>,
    pending: HashSet<u64>,
    window: Duration,
}

impl InFlightWindow {
    pub(crate) fn new(window: Duration) -> Self {
        InFlightWindow {
            recent: HashMap::new(),
            pending: HashSet::new(),
            window,
        }
    }

    /// Records the start of a request.
    pub(crate) fn record_start(&mut self, id: u64, now: Instant) {
        self.recent.insert(id, now);
        self.pending.insert(id);
    }

    /// Forgets a finished request.
    pub(crate) fn finish(&mut self, id: u64) {
        self.recent.remove(&id);
        self.pending.remove(&id);
    }

    /// Drops start records older than the window.
    pub(crate) fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.recent
            .retain(|_, started| now.saturating_duration_since(*started) <= window);
    }

    /// Number of unfinished requests started inside the window.
    pub(crate) fn observed_rate(&mut self, now: Instant) -> u32 {
        self.prune(now);
        u32::try_from(self.recent.len()).unwrap_or(u32::MAX)
    }

    /// Number of unfinished requests, whatever their age.
    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}
