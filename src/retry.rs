//! Retransmission backoff policy

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Computes the delay before retransmission attempt `n` (zero-based).
///
/// The function is shared by every transfer the server spawns, so it
/// must be `Send + Sync`.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Per-flight retry scheduler.
///
/// `backoff` sleeps for whatever the handler computes from the current
/// attempt count, then increments the count. Without a handler the
/// sleep is skipped and a timed-out round-trip retries immediately.
pub(crate) struct Backoff {
    handler: Option<BackoffFn>,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(handler: Option<BackoffFn>) -> Self {
        Backoff {
            handler,
            attempt: 0,
        }
    }

    /// Attempts consumed since the last `reset`
    pub(crate) fn count(&self) -> u32 {
        self.attempt
    }

    /// Start a fresh flight
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) async fn backoff(&mut self) {
        if let Some(handler) = &self.handler {
            sleep(handler(self.attempt)).await;
        }
        self.attempt += 1;
    }
}
