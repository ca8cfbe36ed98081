//! Bounded, linearly backed-off retry for page-side installation steps.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_UNIT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "attempt", rename_all = "snake_case")]
pub enum RetryState {
    /// Attempt `n` (1-based) is next.
    Pending(u32),
    Succeeded(u32),
    Abandoned(u32),
}

impl RetryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RetryState::Pending(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            unit: DEFAULT_RETRY_UNIT,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, unit: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            unit,
        }
    }

    /// Wait before attempt `n`: `n × unit`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt)
    }

    pub fn start(&self) -> RetryState {
        RetryState::Pending(1)
    }

    pub fn advance(&self, state: RetryState, succeeded: bool) -> RetryState {
        match state {
            RetryState::Pending(n) if succeeded => RetryState::Succeeded(n),
            RetryState::Pending(n) if n >= self.max_attempts => RetryState::Abandoned(n),
            RetryState::Pending(n) => RetryState::Pending(n + 1),
            terminal => terminal,
        }
    }

    /// Drives `attempt` until it reports success or the attempts run out.
    /// Exhaustion is logged once at ERROR, naming `label`.
    pub async fn run<F, Fut>(&self, label: &str, mut attempt: F) -> RetryState
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut state = self.start();
        while let RetryState::Pending(n) = state {
            sleep(self.delay_before(n)).await;
            let succeeded = attempt(n).await;
            debug!(target: "feed-patch", label, attempt = n, succeeded, "installation attempt");
            state = self.advance(state, succeeded);
        }
        if let RetryState::Abandoned(attempts) = state {
            error!(target: "feed-patch", label, attempts, "giving up after exhausting attempts");
        }
        state
    }
}
