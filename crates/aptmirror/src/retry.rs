//! Bounded retry with optional linear backoff

use crate::error::SyncError;
use crate::signal::ErrorSignal;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Worth trying again, budget permitting
    Retry(SyncError),
    /// Stop immediately
    Fatal(SyncError),
}

impl<T> Attempt<T> {
    /// Classify a result by [`SyncError::is_transient`]
    pub fn from_result(result: Result<T, SyncError>) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(e) if e.is_transient() => Attempt::Retry(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `step * attempt` after each failed attempt
    Linear(Duration),
}

impl Backoff {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(step) => step * attempt,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent.
    ///
    /// The signal is checked before every attempt; an attempt already in
    /// flight always runs to completion.
    pub async fn run<T, F, Fut>(&self, what: &str, signal: &ErrorSignal, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut last = None;

        for attempt in 1..=self.max_attempts {
            if signal.is_raised() {
                return Err(SyncError::Cancelled(format!(
                    "{} abandoned before attempt {}",
                    what, attempt
                )));
            }

            match op(attempt).await {
                Attempt::Done(value) => {
                    if attempt > 1 {
                        debug!(what = %what, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                },
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retry(e) => {
                    warn!(
                        what = %what,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    last = Some(e);

                    if attempt < self.max_attempts {
                        let delay = self.backoff.delay_after(attempt);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                },
            }
        }

        Err(SyncError::RetriesExhausted {
            what: what.to_string(),
            attempts: self.max_attempts,
            last: Box::new(last.unwrap_or_else(|| SyncError::Cancelled(what.to_string()))),
        })
    }
}
