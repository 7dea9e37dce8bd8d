//! Build-and-run backends: a runner image is built per runtime profile and
//! node version, then run like the docker backend.

use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::ProcessRegistry;
use crate::runner::artifacts::{ResultLayout, BUILD_ARTIFACTS, RESULTS_DIR};
use crate::runner::docker::{self, DockerCli};
use crate::runner::server::{Server, ServerLaunch};
use crate::runner::state::StateCell;
use crate::runner::{RunOptions, RunnerLifecycle};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;

/// A runtime flavour baked into the runner image.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerProfile {
    pub name: &'static str,
    pub runtime: &'static str,
    pub apm: &'static str,
    pub capabilities: Vec<&'static str>,
    pub default_node: &'static str,
    pub env: Vec<(String, String)>,
}

const BASE_CAPABILITIES: &[&str] = &["profiling", "flamegraphs", "heap-snapshots", "perf-data"];

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl RunnerProfile {
    pub fn vanilla() -> Self {
        Self {
            name: "vanilla",
            runtime: "node.js",
            apm: "none",
            capabilities: BASE_CAPABILITIES.to_vec(),
            default_node: "lts",
            env: vec![("RUNTIME_TYPE".to_string(), "vanilla".to_string())],
        }
    }

    /// N|Solid. App name, tags and SaaS key can be set from the host environment.
    pub fn nsolid() -> Self {
        let mut capabilities = BASE_CAPABILITIES.to_vec();
        capabilities.extend(["nsolid-monitoring", "cpu-profiling", "heap-profiling"]);
        Self {
            name: "nsolid",
            runtime: "N|Solid",
            apm: "built-in",
            capabilities,
            default_node: "jod",
            env: vec![
                ("RUNTIME_TYPE".to_string(), "nsolid".to_string()),
                ("NSOLID_APPNAME".to_string(), env_or("NSOLID_APPNAME", "express-benchmark")),
                ("NSOLID_TAGS".to_string(), env_or("NSOLID_TAGS", "benchmark,performance")),
                ("NSOLID_SAAS".to_string(), env_or("NSOLID_SAAS", "")),
            ],
        }
    }

    pub fn node<'a>(&'a self, options: &'a RunOptions) -> &'a str {
        options.node.as_deref().unwrap_or(self.default_node)
    }

    pub fn tag(&self, options: &RunOptions) -> String {
        format!("expf-runner-{}:{}-{}", self.name, self.node(options), options.os)
    }
}

#[derive(Debug)]
pub struct ContainerRunner {
    state: StateCell,
    profile: RunnerProfile,
    docker: DockerCli,
    context: Option<PathBuf>,
}

impl ContainerRunner {
    pub fn new(profile: RunnerProfile) -> Self {
        Self {
            state: StateCell::new(),
            profile,
            docker: DockerCli::default(),
            context: None,
        }
    }

    pub fn with_docker(mut self, docker: DockerCli) -> Self {
        self.docker = docker;
        self
    }

    /// Directory holding the runner Dockerfile. Defaults to the run's `cwd`.
    pub fn with_context(mut self, context: impl Into<PathBuf>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn profile(&self) -> &RunnerProfile {
        &self.profile
    }

    fn build_args(&self, options: &RunOptions) -> Vec<String> {
        let context = self.context.clone().unwrap_or_else(|| options.cwd.clone());
        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            self.profile.tag(options),
            "--build-arg".to_string(),
            format!("NODE_VERSION={}", self.profile.node(options)),
            "--build-arg".to_string(),
            format!("OS={}", options.os),
            "--build-arg".to_string(),
            format!("RUNTIME_TYPE={}", self.profile.name),
        ];
        if options.force_rebuild {
            args.push("--no-cache".to_string());
        }
        args.push(context.display().to_string());
        args
    }

    fn launch(&self, options: &RunOptions) -> Result<ServerLaunch> {
        let tag = self.profile.tag(options);
        let overrides = if options.overrides.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&options.overrides)
                .map_err(|e| ExpfError::InvalidOptions(format!("overrides: {}", e)))?
        };

        let mut env = self.profile.env.clone();
        env.retain(|(key, _)| key != "RUNTIME_TYPE");
        env.insert(0, ("RUNTIME_TYPE".to_string(), self.profile.name.to_string()));
        env.insert(1, ("OVERRIDES".to_string(), overrides));

        let container = docker::container_name();
        let mut args = docker::run_args(options, &container, &env);
        args.push(tag.clone());

        let mut launch = self.docker.launch(
            args,
            docker::READY_MARKER,
            options.ready_timeout.unwrap_or(docker::READY_TIMEOUT),
        )?;
        launch.url = options.server_url();
        launch.layout = Some(ResultLayout::new(options.cwd.join(RESULTS_DIR), BUILD_ARTIFACTS));
        launch.container = Some(container);

        let capabilities = self
            .profile
            .capabilities
            .iter()
            .map(|c| Value::String(c.to_string()))
            .collect();
        let metadata = &mut launch.metadata;
        metadata.insert("url".to_string(), Value::String(launch.url.clone()));
        metadata.insert("dockerTag".to_string(), Value::String(tag));
        metadata.insert("nodeVersion".to_string(), Value::String(self.profile.node(options).to_string()));
        metadata.insert("runnerType".to_string(), Value::String(self.profile.name.to_string()));
        metadata.insert("runtime".to_string(), Value::String(self.profile.runtime.to_string()));
        metadata.insert("apm".to_string(), Value::String(self.profile.apm.to_string()));
        metadata.insert("capabilities".to_string(), Value::Array(capabilities));
        Ok(launch)
    }
}

#[async_trait]
impl RunnerLifecycle for ContainerRunner {
    fn name(&self) -> &'static str {
        self.profile.name
    }

    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    async fn setup(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<()> {
        let tag = self.profile.tag(options);
        info!(tag = %tag, force = options.force_rebuild, "building runner image");
        self.docker
            .command()
            .args(self.build_args(options))
            .run(&ProcessRegistry::new(), cancel)
            .await?;

        self.docker.stop_containers(&tag, cancel).await?;
        docker::reset_results(&options.cwd).await?;
        Ok(())
    }

    async fn start_server(&self, options: &RunOptions, cancel: &CancelSignal) -> Result<Server> {
        let launch = self.launch(options)?;
        Server::launch(launch, self.state.clone(), cancel.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::StaticTestModule;
    use std::sync::Arc;

    fn options() -> RunOptions {
        let mut options = RunOptions::new(Arc::new(StaticTestModule::new("hello", "/work/hello")), "/work");
        options.node = Some("22.4.0".to_string());
        options
    }

    #[test]
    fn test_profiles() {
        let vanilla = RunnerProfile::vanilla();
        assert_eq!(vanilla.runtime, "node.js");
        assert_eq!(vanilla.capabilities.len(), 4);

        let nsolid = RunnerProfile::nsolid();
        assert_eq!(nsolid.apm, "built-in");
        assert!(nsolid.capabilities.contains(&"nsolid-monitoring"));
        assert!(nsolid.env.iter().any(|(k, _)| k == "NSOLID_APPNAME"));
    }

    #[test]
    fn test_build_arguments() {
        let mut options = options();
        options.force_rebuild = true;
        let runner = ContainerRunner::new(RunnerProfile::vanilla()).with_context("/opt/runner");

        let args = runner.build_args(&options);
        assert_eq!(&args[..3], ["build", "-t", "expf-runner-vanilla:22.4.0-bookworm"]);
        assert!(args.contains(&"RUNTIME_TYPE=vanilla".to_string()));
        assert!(args.contains(&"--no-cache".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/opt/runner"));
    }

    #[test]
    fn test_launch_metadata_and_env() {
        let mut options = options();
        options.overrides.insert("express".to_string(), Value::String("5.1.0".to_string()));
        let runner = ContainerRunner::new(RunnerProfile::nsolid());

        let launch = runner.launch(&options).unwrap();
        assert_eq!(launch.metadata["dockerTag"], "expf-runner-nsolid:22.4.0-bookworm");
        assert_eq!(launch.metadata["runnerType"], "nsolid");
        assert_eq!(launch.metadata["runtime"], "N|Solid");
        assert!(launch.args.contains(&"RUNTIME_TYPE=nsolid".to_string()));
        assert!(launch.args.contains(&r#"OVERRIDES={"express":"5.1.0"}"#.to_string()));
        assert_eq!(launch.args.last().map(String::as_str), Some("expf-runner-nsolid:22.4.0-bookworm"));
        assert_eq!(launch.layout.unwrap().artifacts, BUILD_ARTIFACTS);
    }
}
