use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Starting,
    Started,
    Closing,
    Stopped,
    Aborted,
}

impl RunnerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted)
    }

    fn can_become(self, next: RunnerState) -> bool {
        use RunnerState::*;
        matches!(
            (self, next),
            (Starting, Started) | (Started, Closing) | (Closing, Stopped)
        ) || (next == Aborted && !self.is_terminal())
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Closing => "closing",
            Self::Stopped => "stopped",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// The state of one runner invocation. Only forward transitions are applied;
/// anything else is ignored and reported as `false`.
#[derive(Debug, Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<RunnerState>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunnerState::Starting);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> RunnerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.tx.subscribe()
    }

    pub fn transition(&self, next: RunnerState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|current| {
            if current.can_become(next) {
                debug!(from = %current, to = %next, "runner state");
                *current = next;
                applied = true;
            }
            applied
        });
        applied
    }

    /// Resolve once the state is terminal.
    pub async fn finished(&self) -> RunnerState {
        let mut rx = self.subscribe();
        let seen = rx
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state)
            .ok();
        seen.unwrap_or_else(|| self.get())
    }
}
