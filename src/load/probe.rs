use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::process::{ProcessRegistry, ToolCommand};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::OnceCell;
use tracing::debug;

/// What counts as "installed" for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePolicy {
    /// The probe invocation must exit with code 0.
    ExitZero,
    /// Spawning is enough; some tools print usage with a failing code.
    Spawnable,
}

/// A one-time, memoized "is this tool installed" check.
///
/// Racing callers share the in-flight probe, and the outcome (including a
/// failure) is kept for the lifetime of the probe.
///
/// The probe process is tracked in the adapter's registry and honours the
/// adapter's cancel signal like any other run.
#[derive(Debug)]
pub struct PresenceProbe {
    command: ToolCommand,
    policy: ProbePolicy,
    registry: ProcessRegistry,
    cancel: CancelSignal,
    outcome: OnceCell<std::result::Result<(), ExpfError>>,
    attempts: AtomicUsize,
}

impl PresenceProbe {
    pub fn new(
        command: ToolCommand,
        policy: ProbePolicy,
        registry: ProcessRegistry,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            command,
            policy,
            registry,
            cancel,
            outcome: OnceCell::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub async fn ensure(&self) -> Result<()> {
        self.outcome
            .get_or_init(|| self.probe())
            .await
            .clone()
    }

    /// How many probe processes were spawned.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.command.run(&self.registry, &self.cancel).await;
        let tool = self.command.name().to_string();

        let result = match (outcome, self.policy) {
            (Err(err), _) if err.is_cancelled() => return Err(err),
            (Ok(_), _) => Ok(()),
            (Err(ExpfError::ToolExecutionFailed { .. }), ProbePolicy::Spawnable) => Ok(()),
            (Err(ExpfError::ToolSpawnFailed { message, .. }), _) => Err(message),
            (Err(other), _) => Err(other.to_string()),
        };

        debug!(tool = %tool, installed = result.is_ok(), "presence probe finished");
        result.map_err(|cause| ExpfError::ToolNotInstalled {
            executable: tool,
            cause,
        })
    }
}
