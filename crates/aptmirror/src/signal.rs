//! Run-scoped error signal
//!
//! Every worker is handed an [`ErrorSignal`] at construction and polls it
//! before taking new work and between retry attempts. Raising it never
//! interrupts an in-flight call; workers observe it at their next poll point.

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Clone, Default)]
pub struct ErrorSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl ErrorSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. The first reason wins; the signal is never cleared.
    pub fn raise(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.reason.set(reason.clone()).is_ok() {
            error!(reason = %reason, "Error signal raised, workers will stop taking new work");
        }
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Resolves once the signal has been raised
    pub async fn raised(&self) {
        self.token.cancelled().await
    }
}

impl std::fmt::Debug for ErrorSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSignal")
            .field("raised", &self.is_raised())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins_and_stays_raised() {
        let signal = ErrorSignal::new();
        assert!(!signal.is_raised());

        signal.raise("upload failed");
        signal.raise("flip failed");

        assert!(signal.is_raised());
        assert_eq!(signal.reason(), Some("upload failed"));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let signal = ErrorSignal::new();
        let observer = signal.clone();

        let waiter = tokio::spawn(async move {
            observer.raised().await;
            observer.reason().map(str::to_string)
        });

        signal.raise("boom");
        assert_eq!(waiter.await.unwrap().as_deref(), Some("boom"));
    }
}
