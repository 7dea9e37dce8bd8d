use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::options::{RequestOverrides, ToolOptions};
use crate::load::probe::{PresenceProbe, ProbePolicy};
use crate::load::process::{CapturedOutput, ProcessHandle, ProcessRegistry, ToolCommand};
use crate::load::result::ToolResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A load-generator tool behind a uniform contract.
#[async_trait]
pub trait LoadGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one load phase for a request. Overrides are merged over the
    /// generator's own options.
    async fn start(&self, request: &RequestOverrides) -> Result<ToolResult>;

    /// Interrupt every in-flight run and refuse further ones.
    fn close(&self) -> Result<()>;

    fn processes(&self) -> Vec<ProcessHandle> {
        Vec::new()
    }
}

/// State shared by every process-backed generator: the executable, the
/// default options, the presence probe and the process registry.
#[derive(Debug)]
pub struct ToolCore {
    name: &'static str,
    program: Vec<String>,
    defaults: ToolOptions,
    registry: ProcessRegistry,
    probe: PresenceProbe,
    aborted: AtomicBool,
    cancel: CancelSignal,
}

impl ToolCore {
    pub fn new(
        name: &'static str,
        program: Vec<String>,
        defaults: ToolOptions,
        probe_args: &[&str],
        policy: ProbePolicy,
        cancel: CancelSignal,
    ) -> Self {
        let registry = ProcessRegistry::new();
        let probe = PresenceProbe::new(
            ToolCommand::new(name, program.clone()).args(probe_args.iter().copied()),
            policy,
            registry.clone(),
            cancel.clone(),
        );
        Self {
            name,
            program,
            defaults,
            registry,
            probe,
            aborted: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn options(&self, request: &RequestOverrides) -> Result<ToolOptions> {
        self.defaults.for_request(request)
    }

    pub fn command(&self) -> ToolCommand {
        ToolCommand::new(self.name, self.program.clone())
    }

    pub fn probe(&self) -> &PresenceProbe {
        &self.probe
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    fn aborted_error(&self) -> ExpfError {
        if self.cancel.is_cancelled() {
            self.cancel.error()
        } else {
            ExpfError::Cancelled(format!("{} was closed", self.name))
        }
    }

    /// Run the memoized presence probe. A probe cut short by `close()` or
    /// cancellation reports the abort, not a missing tool.
    pub async fn ensure_present(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(self.aborted_error());
        }
        let probed = self.probe.ensure().await;
        if self.is_aborted() {
            return Err(self.aborted_error());
        }
        probed
    }

    /// Probe once, then spawn `command`. Rejects without spawning once closed.
    pub async fn execute(&self, command: ToolCommand) -> Result<CapturedOutput> {
        self.ensure_present().await?;

        let outcome = command.run(&self.registry, &self.cancel).await;
        if self.is_aborted() {
            return Err(self.aborted_error());
        }
        outcome
    }

    pub fn close(&self) {
        debug!(tool = self.name, live = self.registry.running(), "closing");
        self.aborted.store(true, Ordering::SeqCst);
        self.registry.interrupt_all();
    }
}
