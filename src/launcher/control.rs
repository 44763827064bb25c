//! Caller-mutable pause and abort flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::PAUSE_POLL_INTERVAL;

/// Shared pause/abort switches for one launcher run.
///
/// Cloning is cheap and every clone sees the same flags, so a response
/// handler can pause or abort the run it belongs to.
#[derive(Debug, Clone, Default)]
pub struct LaunchControl {
    paused: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
}

impl LaunchControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops new admissions and handler calls until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Makes every slot that has not started yet complete without a request.
    ///
    /// Requests already on the wire finish normally.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Polls until the pause flag is cleared or the run is aborted.
    pub async fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_aborted() {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }
}
