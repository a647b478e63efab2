//! Cancellable one-shot deadlines polled by the connection task.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// A single optional deadline. Re-arming replaces the previous one.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn arm(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.at = None;
    }

    /// Resolves when the deadline passes; never resolves while disarmed.
    pub async fn elapsed(&self) {
        match self.at {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
