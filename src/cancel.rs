use crate::error::ExpfError;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

const DEFAULT_REASON: &str = "aborted";

/// The single cancellation signal of one top-level run.
///
/// Cloning is cheap and every clone observes the same signal. The first
/// reason passed to [`CancelSignal::cancel`] wins.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| DEFAULT_REASON.to_string())
    }

    /// The error pending operations reject with.
    pub fn error(&self) -> ExpfError {
        ExpfError::Cancelled(self.reason())
    }
}
