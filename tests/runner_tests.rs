#![cfg(unix)]

use anyhow::Result;
use expf::cancel::CancelSignal;
use expf::error::ExpfError;
use expf::load::LoadGeneratorKind;
use expf::requests::StaticTestModule;
use expf::runner::artifacts::Artifact;
use expf::runner::docker::DockerCli;
use expf::runner::{self, DockerRunner, LocalRunner, RunOptions, RunnerLifecycle, RunnerState};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MANIFEST: &str = "{\n  \"name\": \"hello\",\n  \"dependencies\": {\"express\": \"^4.21.2\"}\n}\n";

fn write_script(dir: &Path, name: &str, body: &str) -> Vec<String> {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    vec!["sh".to_string(), path.display().to_string()]
}

/// Fake autocannon printing a fixed JSON report; `delay` keeps it running.
fn fake_autocannon(dir: &Path, delay: &str) -> Vec<String> {
    let script = format!(
        "if [ \"$1\" = \"-h\" ]; then exit 0; fi\n\
         trap 'exit 130' INT\n\
         sleep {} >/dev/null 2>&1\n\
         echo '{{\"latency\":{{\"average\":1.5}},\"requests\":{{\"average\":2500}},\"errors\":0}}'\n",
        delay
    );
    write_script(dir, "autocannon.sh", &script)
}

fn options(dir: &Path, test: StaticTestModule, autocannon: Vec<String>) -> RunOptions {
    let mut options = RunOptions::new(Arc::new(test), dir);
    options.ready_timeout = Some(Duration::from_secs(10));
    options.load.generators = vec![LoadGeneratorKind::Autocannon];
    options.load.tool.duration = Some(1);
    options.load.executables.insert("autocannon".to_string(), autocannon);
    options
}

fn sh(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

#[tokio::test]
async fn test_local_run_end_to_end() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("package.json"), MANIFEST)?;
    let test = StaticTestModule::new("hello", dir.path())
        .with_server(sh("cp package.json seen.json; echo \"startup: 12ms\"; exec sleep 30"));

    let mut options = options(dir.path(), test, fake_autocannon(dir.path(), "0"));
    options.overrides.insert("qs".to_string(), json!("6.13.0"));
    options.uws = true;

    let runner = LocalRunner::new();
    let result = runner::run(&runner, &options, &CancelSignal::new())
        .await?
        .expect("run was not cancelled");

    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(result.client_results.len(), 1);
    assert_eq!(result.client_results[0].requests_per_second, Some(2500.0));
    assert_eq!(result.options.runner, "local");
    assert_eq!(result.server_metadata["url"], "http://localhost:3000/");
    assert!(result.server_metadata.contains_key("platform"));
    assert_eq!(result.client_metadata["loadGenerators"], json!(["autocannon"]));
    match &result.server_results["output"] {
        Artifact::Text { content, .. } => assert!(content.contains("startup: 12ms")),
        other => panic!("unexpected output artifact: {:?}", other),
    }

    // The server saw the patched manifest; afterwards the original is back.
    let seen: Value = serde_json::from_str(&std::fs::read_to_string(dir.path().join("seen.json"))?)?;
    assert_eq!(seen["overrides"]["qs"], "6.13.0");
    assert_eq!(seen["dependencies"]["uwebsockets-express"], "1.3.13");
    assert_eq!(std::fs::read_to_string(dir.path().join("package.json"))?, MANIFEST);
    assert!(!dir.path().join("package.json.bak").exists());

    let serialized = serde_json::to_value(&result)?;
    assert!(serialized.get("serverResults").is_some());
    assert!(serialized.get("clientResults").is_some());
    Ok(())
}

#[tokio::test]
async fn test_cancellation_interrupts_server_and_restores_manifest() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("package.json"), MANIFEST)?;
    let marker = dir.path().join("interrupted.txt");
    let server = format!(
        "trap 'echo interrupted > \"{}\"; exit 0' INT\n\
         echo \"startup: ok\"\n\
         while true; do sleep 0.1; done\n",
        marker.display()
    );
    let server = write_script(dir.path(), "server.sh", &server);
    let test = StaticTestModule::new("hello", dir.path()).with_server(server);

    let mut options = options(dir.path(), test, fake_autocannon(dir.path(), "30"));
    options.overrides.insert("express".to_string(), json!("5.1.0"));

    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        trigger.cancel("received SIGINT");
    });

    let runner = LocalRunner::new();
    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        runner::run(&runner, &options, &cancel),
    )
    .await?;

    match outcome {
        Err(ExpfError::Cancelled(reason)) => assert_eq!(reason, "received SIGINT"),
        other => panic!("expected cancellation, got {:?}", other.map(|r| r.is_some())),
    }
    assert_eq!(runner.state(), RunnerState::Aborted);
    assert_eq!(std::fs::read_to_string(&marker)?.trim(), "interrupted");
    assert_eq!(std::fs::read_to_string(dir.path().join("package.json"))?, MANIFEST);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_while_starting_interrupts_server() -> Result<()> {
    let dir = TempDir::new()?;
    let marker = dir.path().join("interrupted.txt");
    let server = format!(
        "trap 'echo interrupted > \"{}\"; exit 0' INT\n\
         while true; do sleep 0.1; done\n",
        marker.display()
    );
    let server = write_script(dir.path(), "server.sh", &server);
    let test = StaticTestModule::new("slow", dir.path()).with_server(server);
    let options = options(dir.path(), test, fake_autocannon(dir.path(), "0"));

    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel("stop now");
    });

    let runner = LocalRunner::new();
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        runner.start_server(&options, &cancel),
    )
    .await?;

    match outcome {
        Err(ExpfError::Cancelled(reason)) => assert_eq!(reason, "stop now"),
        Err(other) => panic!("expected cancellation, got {:?}", other),
        Ok(_) => panic!("server became ready without a marker"),
    }
    assert_eq!(runner.state(), RunnerState::Aborted);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !marker.exists() {
        assert!(tokio::time::Instant::now() < deadline, "server never saw SIGINT");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(std::fs::read_to_string(&marker)?.trim(), "interrupted");
    Ok(())
}

#[tokio::test]
async fn test_client_close_leaves_no_live_processes() -> Result<()> {
    let dir = TempDir::new()?;
    let test = StaticTestModule::new("hello", dir.path())
        .with_server(sh("echo \"startup: 1ms\"; exec sleep 30"));
    let options = options(dir.path(), test, fake_autocannon(dir.path(), "0"));
    let cancel = CancelSignal::new();

    let runner = LocalRunner::new();
    let server = runner.start_server(&options, &cancel).await?;
    let client = runner
        .start_client(&options, &server, &cancel)
        .await?
        .expect("client started");

    let results = client.results().await?;
    assert_eq!(results.len(), 1);
    client.close();
    server.close().await?;

    let processes = client.processes();
    assert!(!processes.is_empty());
    assert!(processes.iter().all(|p| !p.is_live()));
    assert_eq!(runner.state(), RunnerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_readiness_timeout_kills_server() -> Result<()> {
    let dir = TempDir::new()?;
    let test = StaticTestModule::new("silent", dir.path()).with_server(sh("exec sleep 30"));
    let mut options = options(dir.path(), test, fake_autocannon(dir.path(), "0"));
    options.ready_timeout = Some(Duration::from_millis(300));

    let runner = LocalRunner::new();
    let started = std::time::Instant::now();
    let err = runner::run(&runner, &options, &CancelSignal::new()).await.unwrap_err();

    assert!(matches!(err, ExpfError::ReadinessTimeout { .. }));
    assert_eq!(runner.state(), RunnerState::Aborted);
    assert!(started.elapsed() < Duration::from_secs(10));
    Ok(())
}

#[tokio::test]
async fn test_server_exiting_before_ready() -> Result<()> {
    let dir = TempDir::new()?;
    let test = StaticTestModule::new("crash", dir.path()).with_server(sh("echo boom; exit 3"));
    let options = options(dir.path(), test, fake_autocannon(dir.path(), "0"));

    let runner = LocalRunner::new();
    let err = runner::run(&runner, &options, &CancelSignal::new()).await.unwrap_err();
    assert!(matches!(err, ExpfError::ServerExited { code: Some(3), .. }));
    assert_eq!(runner.state(), RunnerState::Aborted);
    Ok(())
}

#[tokio::test]
async fn test_failed_setup_still_restores_manifest() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("package.json"), MANIFEST)?;
    let test = StaticTestModule::new("hello", dir.path())
        .with_setup(sh("exit 1"))
        .with_server(sh("echo \"startup: 1\"; exec sleep 30"));
    let mut options = options(dir.path(), test, fake_autocannon(dir.path(), "0"));
    options.uws = true;

    let runner = LocalRunner::new();
    let err = runner::run(&runner, &options, &CancelSignal::new()).await.unwrap_err();
    assert!(matches!(err, ExpfError::ToolExecutionFailed { .. }));
    assert_eq!(std::fs::read_to_string(dir.path().join("package.json"))?, MANIFEST);
    assert!(!dir.path().join("package.json.bak").exists());
    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_start_spawns_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let spawned = dir.path().join("spawned.txt");
    let test = StaticTestModule::new("hello", dir.path())
        .with_server(sh(&format!("echo yes > \"{}\"; echo \"startup: 1\"", spawned.display())));
    let options = options(dir.path(), test, fake_autocannon(dir.path(), "0"));

    let cancel = CancelSignal::new();
    cancel.cancel("received SIGTERM");
    let runner = LocalRunner::new();
    let err = runner::run(&runner, &options, &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(runner.state(), RunnerState::Aborted);
    assert!(!spawned.exists());
    Ok(())
}

#[tokio::test]
async fn test_docker_run_collects_container_artifacts() -> Result<()> {
    let dir = TempDir::new()?;
    let docker = write_script(
        dir.path(),
        "docker.sh",
        "case \"$1\" in\n\
         ps) exit 0 ;;\n\
         run)\n\
           for arg in \"$@\"; do\n\
             case \"$arg\" in *:/home/node/results) results=\"${arg%:/home/node/results}\" ;; esac\n\
           done\n\
           echo 'container output' > \"$results/output.txt\"\n\
           echo '{\"nodeVersion\": \"22.4.0\"}' > \"$results/metadata.json\"\n\
           trap 'exit 0' INT\n\
           echo Running\n\
           while true; do sleep 0.1; done\n\
           ;;\n\
         esac\n",
    );
    std::fs::create_dir_all(dir.path().join("results"))?;
    std::fs::write(dir.path().join("results").join("profile.svg"), "stale")?;

    let test = StaticTestModule::new("hello", dir.path());
    let options = options(dir.path(), test, fake_autocannon(dir.path(), "0"));
    let runner = DockerRunner::new().with_docker(DockerCli::new(docker));

    let result = runner::run(&runner, &options, &CancelSignal::new())
        .await?
        .expect("run was not cancelled");

    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(matches!(&result.server_results["output"], Artifact::Text { content, .. } if content.trim() == "container output"));
    // Stale results from an earlier run were cleared by setup.
    assert!(result.server_results["flamegraph"].is_error());
    assert!(result.server_results["rawPerfData"].is_error());
    assert!(!result.server_results.contains_key("metadata"));
    assert_eq!(result.server_metadata["nodeVersion"], "22.4.0");
    assert!(result.server_metadata["container"]
        .as_str()
        .is_some_and(|name| name.starts_with("expf-")));
    assert_eq!(result.client_results.len(), 1);
    Ok(())
}
