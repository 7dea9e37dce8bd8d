//! Runs the test inside the prebuilt `perf-runner` image. The `docker run`
//! client is the supervised process; the container prints `Running` once
//! the server inside it is listening.

use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::{ProcessRegistry, ToolCommand};
use crate::runner::artifacts::{ArtifactSpec, ResultLayout, CONTAINER_ARTIFACTS, RESULTS_DIR};
use crate::runner::server::{Server, ServerLaunch};
use crate::runner::state::StateCell;
use crate::runner::{RunOptions, RunnerLifecycle};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const NAME: &str = "docker";
pub const DEFAULT_IMAGE: &str = "perf-runner:latest";
pub const READY_MARKER: &str = "Running";
pub const READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const CONTAINER_REPO: &str = "/home/node/repo";
pub const CONTAINER_RESULTS: &str = "/home/node/results";
const CONTAINER_PORT: u16 = 3000;
const INSPECTOR_PORT: u16 = 9229;

/// The `docker` executable (or a stand-in argv prefix) shared by the
/// container backends.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: Vec<String>,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: vec!["docker".to_string()],
        }
    }
}

impl DockerCli {
    pub fn new(program: Vec<String>) -> Self {
        Self { program }
    }

    pub fn command(&self) -> ToolCommand {
        ToolCommand::new("docker", self.program.clone())
    }

    /// Stop every running container started from `image`.
    pub async fn stop_containers(&self, image: &str, cancel: &CancelSignal) -> Result<usize> {
        let registry = ProcessRegistry::new();
        let listed = self
            .command()
            .args(["ps", "-q", "--filter"])
            .arg(format!("ancestor={}", image))
            .run(&registry, cancel)
            .await?;

        let ids: Vec<&str> = listed.stdout.split_whitespace().collect();
        for id in ids.iter().copied() {
            info!(container = id, image, "stopping running container");
            self.command().args(["stop", id]).run(&registry, cancel).await?;
        }
        Ok(ids.len())
    }

    /// A server launch of `docker <args...>`.
    pub fn launch(&self, args: Vec<String>, marker: &str, ready_timeout: Duration) -> Result<ServerLaunch> {
        let (program, prefix) = self
            .program
            .split_first()
            .ok_or_else(|| ExpfError::InvalidOptions("no docker executable configured".to_string()))?;
        let mut launch = ServerLaunch::new(program.clone(), marker, ready_timeout);
        launch.args = prefix.iter().cloned().chain(args).collect();
        Ok(launch)
    }
}

/// Replace `<cwd>/results` with an empty directory.
pub async fn reset_results(cwd: &Path) -> Result<PathBuf> {
    let results = cwd.join(RESULTS_DIR);
    match tokio::fs::remove_dir_all(&results).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ExpfError::io(format!("removing {}", results.display()), e)),
    }
    tokio::fs::create_dir_all(&results)
        .await
        .map_err(|e| ExpfError::io(format!("creating {}", results.display()), e))?;
    Ok(results)
}

/// `docker run` arguments shared by the container backends, up to (not
/// including) the image.
pub fn run_args(options: &RunOptions, container: &str, env: &[(String, String)]) -> Vec<String> {
    let cwd = options.cwd.display().to_string();
    let results = options.cwd.join(RESULTS_DIR).display().to_string();

    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container.to_string(),
    ];
    let base = [
        ("REPO", options.repo.clone().unwrap_or_default()),
        ("REF", options.repo_ref.clone().unwrap_or_default()),
        ("TEST", options.test.specifier().to_string()),
    ];
    let envs = base
        .iter()
        .map(|(k, v)| (*k, v.as_str()))
        .chain(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    for (key, value) in envs {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.extend([
        "--volume".to_string(),
        format!("{}:{}", cwd, CONTAINER_REPO),
        "--volume".to_string(),
        format!("{}:{}", results, CONTAINER_RESULTS),
        "-p".to_string(),
        format!("{}:{}", options.port, CONTAINER_PORT),
        "-p".to_string(),
        format!("{}:{}", INSPECTOR_PORT, INSPECTOR_PORT),
    ]);
    args
}

pub fn container_name() -> String {
    format!("expf-{}", uuid::Uuid::new_v4())
}

#[derive(Debug)]
pub struct DockerRunner {
    state: StateCell,
    docker: DockerCli,
    image: String,
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerRunner {
    pub fn new() -> Self {
        Self {
            state: StateCell::new(),
            docker: DockerCli::default(),
            image: DEFAULT_IMAGE.to_string(),
        }
    }

    pub fn with_docker(mut self, docker: DockerCli) -> Self {
        self.docker = docker;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    fn launch(&self, options: &RunOptions, artifacts: &[ArtifactSpec]) -> Result<ServerLaunch> {
        let container = container_name();
        let mut args = run_args(options, &container, &[("NO_SPIN".to_string(), "1".to_string())]);
        args.push(self.image.clone());

        let mut launch = self.docker.launch(
            args,
            READY_MARKER,
            options.ready_timeout.unwrap_or(READY_TIMEOUT),
        )?;
        launch.url = options.server_url();
        launch.layout = Some(ResultLayout::new(options.cwd.join(RESULTS_DIR), artifacts));
        launch.container = Some(container.clone());
        launch.metadata.insert("url".to_string(), Value::String(launch.url.clone()));
        launch.metadata.insert("container".to_string(), Value::String(container));
        launch.metadata.insert("dockerImage".to_string(), Value::String(self.image.clone()));
        Ok(launch)
    }
}

#[async_trait]
impl RunnerLifecycle for DockerRunner {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    async fn setup(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<()> {
        let stopped = self.docker.stop_containers(&self.image, cancel).await?;
        let results = reset_results(&options.cwd).await?;
        debug!(stopped, results = %results.display(), "docker environment ready");
        Ok(())
    }

    async fn start_server(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<Server> {
        let launch = self.launch(options, CONTAINER_ARTIFACTS)?;
        Server::launch(launch, self.state.clone(), cancel.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::StaticTestModule;
    use std::sync::Arc;

    #[test]
    fn test_run_arguments() {
        let mut options = RunOptions::new(Arc::new(StaticTestModule::new("hello", "/work/hello")), "/work");
        options.repo = Some("https://github.com/expressjs/express".to_string());
        options.repo_ref = Some("5.x".to_string());

        let launch = DockerRunner::new().launch(&options, CONTAINER_ARTIFACTS).unwrap();
        assert_eq!(launch.program, "docker");
        let container = launch.container.clone().unwrap();
        assert!(container.starts_with("expf-"));

        let expected: Vec<String> = [
            "run",
            "--rm",
            "--name",
            container.as_str(),
            "--env",
            "REPO=https://github.com/expressjs/express",
            "--env",
            "REF=5.x",
            "--env",
            "TEST=hello",
            "--env",
            "NO_SPIN=1",
            "--volume",
            "/work:/home/node/repo",
            "--volume",
            "/work/results:/home/node/results",
            "-p",
            "3000:3000",
            "-p",
            "9229:9229",
            "perf-runner:latest",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(launch.args, expected);
        assert_eq!(launch.marker, "Running");
        assert_eq!(launch.ready_timeout, READY_TIMEOUT);
        assert_eq!(launch.layout.unwrap().artifacts, CONTAINER_ARTIFACTS);
    }

    #[test]
    fn test_container_names_are_unique() {
        assert_ne!(container_name(), container_name());
    }

    #[tokio::test]
    async fn test_reset_results_empties_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let stale = dir.path().join(RESULTS_DIR).join("output.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old run").unwrap();

        let results = reset_results(dir.path()).await.unwrap();
        assert!(results.is_dir());
        assert_eq!(std::fs::read_dir(&results).unwrap().count(), 0);
    }
}
