//! Runs the test's server as a native child process next to the load tools.

use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::{ProcessRegistry, ToolCommand};
use crate::manifest::{ManifestOptions, ManifestPatcher};
use crate::runner::metadata::collect_metadata;
use crate::runner::server::{Server, ServerLaunch};
use crate::runner::state::StateCell;
use crate::runner::{RunOptions, RunnerLifecycle};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const NAME: &str = "local";
pub const READY_MARKER: &str = "startup:";
pub const READY_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const DEFAULT_SERVER: &[&str] = &["node", "index.mjs"];

#[derive(Debug)]
pub struct LocalRunner {
    state: StateCell,
    node: Vec<String>,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRunner {
    pub fn new() -> Self {
        Self {
            state: StateCell::new(),
            node: vec!["node".to_string()],
        }
    }

    /// Replace the `node` executable used for the version check.
    pub fn with_node(mut self, program: Vec<String>) -> Self {
        self.node = program;
        self
    }

    fn patcher(options: &RunOptions) -> ManifestPatcher {
        ManifestPatcher::new(options.test.directory())
    }

    async fn check_node_version(&self, wanted: &str, cancel: &CancelSignal) -> Result<()> {
        let output = ToolCommand::new("node", self.node.clone())
            .arg("--version")
            .run(&ProcessRegistry::new(), cancel)
            .await?;
        let found = output.stdout.trim().trim_start_matches('v');
        let wanted = wanted.trim_start_matches('v');
        if found != wanted {
            return Err(ExpfError::InvalidOptions(format!(
                "incorrect node.js version: wanted {}, found {}",
                wanted, found
            )));
        }
        Ok(())
    }

    fn launch(options: &RunOptions) -> Result<ServerLaunch> {
        let test = &options.test;
        let directory = test.directory();
        let argv: Vec<String> = match test.server() {
            Some(server) => server.command.clone(),
            None => DEFAULT_SERVER.iter().map(|s| s.to_string()).collect(),
        };
        let (program, args) = argv.split_first().ok_or_else(|| {
            ExpfError::InvalidOptions(format!("test {} has an empty server command", test.name()))
        })?;

        let mut launch = ServerLaunch::new(
            resolve_program(directory, program),
            READY_MARKER,
            options.ready_timeout.unwrap_or(READY_TIMEOUT),
        );
        launch.args = args.to_vec();
        launch.cwd = Some(directory.to_path_buf());
        launch.url = options.server_url();
        launch.capture_output = true;
        launch.env.push(("PORT".to_string(), options.port.to_string()));
        if options.uws {
            launch.env.push(("USE_UWS".to_string(), "1".to_string()));
        }
        if let Some(server) = test.server() {
            launch
                .env
                .extend(server.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        launch.metadata.insert("url".to_string(), Value::String(launch.url.clone()));
        launch.metadata.extend(collect_metadata());
        Ok(launch)
    }
}

/// Relative paths with a separator are taken from the test directory; bare
/// names are left for `PATH` lookup.
fn resolve_program(directory: &Path, program: &str) -> String {
    let path = PathBuf::from(program);
    if path.is_relative() && path.components().count() > 1 {
        directory.join(path).to_string_lossy().into_owned()
    } else {
        program.to_string()
    }
}

#[async_trait]
impl RunnerLifecycle for LocalRunner {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    async fn setup(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<()> {
        if let Some(repo) = &options.repo {
            return Err(ExpfError::InvalidOptions(format!(
                "the local runner uses the test directory in place; cloning {} is not supported",
                repo
            )));
        }
        if let Some(node) = &options.node {
            self.check_node_version(node, cancel).await?;
        }

        let manifest = ManifestOptions {
            overrides: options.overrides.clone(),
            uws: options.uws,
        };
        let outcome = Self::patcher(options).setup(&manifest).await?;
        debug!(outcome = ?outcome, "manifest setup");

        if let Some(setup) = options.test.setup() {
            info!(test = options.test.name(), "running setup command");
            ToolCommand::new("setup", setup.to_vec())
                .current_dir(options.test.directory())
                .run(&ProcessRegistry::new(), cancel)
                .await?;
        }
        Ok(())
    }

    async fn start_server(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<Server> {
        let launch = Self::launch(options)?;
        Server::launch(launch, self.state.clone(), cancel.clone()).await
    }

    async fn cleanup(&self, options: &RunOptions) -> Result<()> {
        Self::patcher(options).cleanup().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::StaticTestModule;
    use std::sync::Arc;

    #[test]
    fn test_launch_environment() {
        let test = StaticTestModule::new("hello", "/srv/hello")
            .with_server(vec!["./bin/server.sh".to_string(), "--fast".to_string()]);
        let mut options = RunOptions::new(Arc::new(test), "/srv");
        options.uws = true;
        options.port = 4000;

        let launch = LocalRunner::launch(&options).unwrap();
        assert_eq!(launch.program, "/srv/hello/./bin/server.sh");
        assert_eq!(launch.args, ["--fast"]);
        assert_eq!(launch.marker, READY_MARKER);
        assert_eq!(launch.ready_timeout, READY_TIMEOUT);
        assert_eq!(launch.url, "http://localhost:4000/");
        assert!(launch.env.contains(&("PORT".to_string(), "4000".to_string())));
        assert!(launch.env.contains(&("USE_UWS".to_string(), "1".to_string())));
        assert!(launch.capture_output);
    }

    #[test]
    fn test_default_server_command() {
        let options = RunOptions::new(Arc::new(StaticTestModule::new("hello", "/srv/hello")), "/srv");
        let launch = LocalRunner::launch(&options).unwrap();
        assert_eq!(launch.program, "node");
        assert_eq!(launch.args, ["index.mjs"]);
        assert!(!launch.env.iter().any(|(k, _)| k == "USE_UWS"));
    }

    #[tokio::test]
    async fn test_repo_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut options = RunOptions::new(Arc::new(StaticTestModule::new("hello", dir.path())), dir.path());
        options.repo = Some("https://example.com/express.git".to_string());

        let err = LocalRunner::new()
            .setup(&options, &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExpfError::InvalidOptions(_)));
    }
}
