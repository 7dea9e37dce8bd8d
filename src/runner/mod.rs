//! Runner backends and the top-level run sequence.
//!
//! Every backend implements [`RunnerLifecycle`]: it acquires its environment
//! in `setup`, starts the server-under-test, optionally overrides how the
//! client phase starts, and releases everything in `cleanup`. [`run`] pairs
//! each acquisition with its release on every path, including cancellation.

pub mod artifacts;
pub mod client;
pub mod container;
pub mod docker;
pub mod local;
pub mod metadata;
pub mod readiness;
pub mod server;
pub mod state;

pub use client::Client;
pub use container::{ContainerRunner, RunnerProfile};
pub use docker::DockerRunner;
pub use local::LocalRunner;
pub use server::{Server, ServerLaunch};
pub use state::{RunnerState, StateCell};

use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::{LoadOptions, ToolResult};
use crate::requests::TestModule;
use artifacts::Artifact;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_OS: &str = "bookworm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Local,
    Docker,
    Vanilla,
    Nsolid,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Vanilla => "vanilla",
            Self::Nsolid => "nsolid",
        }
    }

    /// A fresh runner, with its own state, for one invocation.
    pub fn create(&self) -> Box<dyn RunnerLifecycle> {
        match self {
            Self::Local => Box::new(LocalRunner::new()),
            Self::Docker => Box::new(DockerRunner::new()),
            Self::Vanilla => Box::new(ContainerRunner::new(RunnerProfile::vanilla())),
            Self::Nsolid => Box::new(ContainerRunner::new(RunnerProfile::nsolid())),
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerKind {
    type Err = ExpfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "docker" | "local-docker" => Ok(Self::Docker),
            "vanilla" => Ok(Self::Vanilla),
            "nsolid" => Ok(Self::Nsolid),
            other => Err(ExpfError::InvalidOptions(format!("unknown runner: {}", other))),
        }
    }
}

/// Options for one benchmark run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub test: Arc<dyn TestModule>,
    /// Repository checkout mounted into containers and holding `results/`.
    pub cwd: PathBuf,
    pub repo: Option<String>,
    pub repo_ref: Option<String>,
    pub node: Option<String>,
    pub os: String,
    pub overrides: Map<String, Value>,
    pub uws: bool,
    pub load: LoadOptions,
    pub ready_timeout: Option<Duration>,
    pub port: u16,
    pub force_rebuild: bool,
}

impl RunOptions {
    pub fn new(test: Arc<dyn TestModule>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            test,
            cwd: cwd.into(),
            repo: None,
            repo_ref: None,
            node: None,
            os: DEFAULT_OS.to_string(),
            overrides: Map::new(),
            uws: false,
            load: LoadOptions::default(),
            ready_timeout: None,
            port: DEFAULT_PORT,
            force_rebuild: false,
        }
    }

    pub fn server_url(&self) -> String {
        format!("http://localhost:{}/", self.port)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub runner: String,
    pub test: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub overrides: Map<String, Value>,
    pub uws: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub options: RunSummary,
    pub server_metadata: Map<String, Value>,
    pub client_metadata: Map<String, Value>,
    pub server_results: IndexMap<String, Artifact>,
    pub client_results: Vec<ToolResult>,
}

#[async_trait]
pub trait RunnerLifecycle: Send + Sync {
    fn name(&self) -> &'static str;

    fn state_cell(&self) -> &StateCell;

    fn state(&self) -> RunnerState {
        self.state_cell().get()
    }

    /// Acquire the environment the server needs.
    async fn setup(&self, _options: &RunOptions, _cancel: &CancelSignal) -> Result<()> {
        Ok(())
    }

    async fn start_server(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<Server>;

    async fn start_client(
        &self,
        options: &RunOptions,
        server: &Server,
        cancel: &CancelSignal,
    ) -> Result<Option<Client>> {
        Client::start(options, server, cancel).await
    }

    /// Release what `setup` acquired. Runs on every path once `setup` was attempted.
    async fn cleanup(&self, _options: &RunOptions) -> Result<()> {
        Ok(())
    }
}

/// Run one benchmark end to end. `Ok(None)` means the run was cancelled
/// before its client phase could start; the server was still closed.
pub async fn run(
    runner: &dyn RunnerLifecycle,
    options: &RunOptions,
    cancel: &CancelSignal,
) -> Result<Option<RunResult>> {
    info!(runner = runner.name(), test = options.test.name(), "starting run");

    let outcome = match runner.setup(options, cancel).await {
        Ok(()) => drive(runner, options, cancel).await,
        Err(err) => Err(err),
    };

    let cleanup = runner.cleanup(options).await;
    match (outcome, cleanup) {
        (outcome, Ok(())) => outcome,
        (Ok(_), Err(err @ ExpfError::ManifestRestoreFailed { .. })) => Err(err),
        (outcome, Err(err)) => {
            warn!(runner = runner.name(), error = %err, "cleanup failed");
            outcome
        }
    }
}

async fn drive(
    runner: &dyn RunnerLifecycle,
    options: &RunOptions,
    cancel: &CancelSignal,
) -> Result<Option<RunResult>> {
    let server = runner.start_server(options, cancel).await?;

    let client = match runner.start_client(options, &server, cancel).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            close_server(&server).await;
            return Ok(None);
        }
        Err(err) => {
            close_server(&server).await;
            return Err(err);
        }
    };

    let collected = async {
        let client_results = client.results().await?;
        let server_results = server.results().await?;
        Ok::<_, ExpfError>((client_results, server_results))
    }
    .await;

    client.close();
    let closed = server.close().await;
    let (client_results, server_results) = collected?;
    closed?;

    info!(
        runner = runner.name(),
        results = client_results.len(),
        state = %runner.state(),
        "run finished"
    );
    Ok(Some(RunResult {
        options: RunSummary {
            runner: runner.name().to_string(),
            test: options.test.specifier().to_string(),
            node: options.node.clone(),
            overrides: options.overrides.clone(),
            uws: options.uws,
        },
        server_metadata: server.metadata(),
        client_metadata: client.metadata().clone(),
        server_results,
        client_results,
    }))
}

async fn close_server(server: &Server) {
    if let Err(err) = server.close().await {
        warn!(error = %err, "failed to close server");
    }
}
