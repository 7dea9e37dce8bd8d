use anyhow::{anyhow, Context, Result};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{print_field, use_color};
use crate::cancel::CancelSignal;
use crate::config::ExpfConfig;
use crate::load::{LoadGeneratorKind, ToolOverrides, ToolResult};
use crate::requests::FileTestModule;
use crate::runner::artifacts::RESULTS_DIR;
use crate::runner::{self, RunOptions, RunResult, RunnerKind};
use crate::utils::{parse_duration, parse_headers, parse_json_object};

pub struct LoadArgs {
    pub runner: Option<String>,
    pub test: Option<String>,
    pub cwd: Option<PathBuf>,
    pub repo: Option<String>,
    pub repo_ref: Option<String>,
    pub node: Option<String>,
    pub os: Option<String>,
    pub overrides: Option<String>,
    pub uws: bool,
    pub duration: Option<String>,
    pub connections: Option<u32>,
    pub rate: Option<u32>,
    pub headers: Vec<String>,
    pub parallel: bool,
    pub generators: Vec<String>,
    pub ready_timeout: Option<String>,
    pub port: Option<u16>,
    pub force_rebuild: bool,
    pub config: Option<PathBuf>,
    pub no_write: bool,
    /// Print the run result as JSON on stdout instead of the summary.
    pub json: bool,
}

/// Flags over config file over defaults, per key.
pub fn resolve_options(args: &LoadArgs, config: ExpfConfig, cwd: &Path) -> Result<(RunnerKind, RunOptions)> {
    let kind: RunnerKind = args
        .runner
        .as_deref()
        .or(config.runner.as_deref())
        .unwrap_or(runner::local::NAME)
        .parse()?;

    let specifier = args
        .test
        .clone()
        .or(config.test.clone())
        .unwrap_or_else(|| cwd.display().to_string());
    let test = FileTestModule::resolve(&specifier)?;

    let mut options = RunOptions::new(Arc::new(test), cwd);
    options.repo = args.repo.clone().or(config.repo);
    options.repo_ref = args.repo_ref.clone().or(config.repo_ref);
    options.node = args.node.clone().or(config.node);
    if let Some(os) = args.os.clone().or(config.os) {
        options.os = os;
    }
    options.overrides = config.overrides;
    if let Some(flag) = &args.overrides {
        options.overrides.extend(parse_json_object(flag).context("Invalid --overrides")?);
    }
    options.uws = args.uws || config.uws;
    if let Some(port) = args.port.or(config.port) {
        options.port = port;
    }
    options.force_rebuild = args.force_rebuild;

    if let Some(timeout) = args.ready_timeout.as_deref().or(config.ready_timeout.as_deref()) {
        options.ready_timeout = Some(parse_duration(timeout).context("Invalid ready timeout")?);
    }

    let mut load = config.load;
    let duration = match &args.duration {
        Some(value) => Some(parse_duration(value).context("Invalid --duration")?.as_secs()),
        None => None,
    };
    let flags = ToolOverrides {
        duration,
        connections: args.connections,
        rate: args.rate,
        headers: parse_headers(&args.headers)?,
        ..Default::default()
    };
    load.tool = load.tool.merged(&flags);
    if !args.generators.is_empty() {
        load.generators = args
            .generators
            .iter()
            .map(|g| g.parse::<LoadGeneratorKind>())
            .collect::<std::result::Result<_, _>>()?;
    }
    load.parallel = load.parallel || args.parallel;
    options.load = load;

    Ok((kind, options))
}

pub async fn handle_load(args: LoadArgs, cancel: CancelSignal) -> Result<()> {
    let cwd = match &args.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir().context("Unable to read the current directory")?,
    };
    let config = ExpfConfig::load(args.config.as_deref(), &cwd)?;
    let (kind, options) = resolve_options(&args, config, &cwd)?;

    if !args.json {
        print_summary(kind, &options);
    }

    let runner = kind.create();
    let outcome = runner::run(runner.as_ref(), &options, &cancel).await;
    let result = match outcome {
        Ok(Some(result)) => result,
        Ok(None) => return Err(anyhow!("Run cancelled: {}", cancel.reason())),
        Err(err) if err.is_cancelled() => return Err(anyhow!("Run cancelled: {}", cancel.reason())),
        Err(err) => return Err(err).context(format!("{} run failed", kind)),
    };

    let written = if args.no_write {
        None
    } else {
        Some(write_result(options.test.directory(), &result).await?)
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        if let Some(path) = written {
            tracing::info!(path = %path.display(), "wrote result");
        }
        return Ok(());
    }

    println!();
    println!("{} Load test completed", "✔".green().bold());
    print_results(&result.client_results);
    if let Some(path) = written {
        print_field("Results", path.display());
    }
    Ok(())
}

fn print_summary(kind: RunnerKind, options: &RunOptions) {
    println!("{} Starting load test", "→".cyan());
    print_field("Runner", kind);
    print_field("Test", options.test.directory().display());
    let generators: Vec<String> = options.load.kinds().iter().map(|k| k.to_string()).collect();
    print_field("Load generators", generators.join(", "));
    if !options.overrides.is_empty() {
        print_field("Overrides", serde_json::Value::Object(options.overrides.clone()));
    }
}

fn print_results(results: &[ToolResult]) {
    let metric = |value: Option<f64>, unit: &str| match value {
        Some(v) => format!("{:.2}{}", v, unit),
        None => "-".to_string(),
    };
    for result in results {
        let label = format!("{} {} {}", result.tool, result.method, result.url);
        let errors = result.errors.map(|e| e.to_string()).unwrap_or_else(|| "-".to_string());
        let line = format!(
            "  latency {}  rps {}  errors {}",
            metric(result.average_latency_ms, "ms"),
            metric(result.requests_per_second, ""),
            errors
        );
        if use_color() {
            println!("{}", label.bold());
            println!("{}", line.bright_black());
        } else {
            println!("{}", label);
            println!("{}", line);
        }
    }
}

/// Save under `<dir>/results/result-<epoch ms>.json`.
pub async fn write_result(directory: &Path, result: &RunResult) -> Result<PathBuf> {
    let results = directory.join(RESULTS_DIR);
    tokio::fs::create_dir_all(&results)
        .await
        .with_context(|| format!("Failed to create {}", results.display()))?;

    let path = results.join(format!("result-{}.json", chrono::Utc::now().timestamp_millis()));
    let content = serde_json::to_string_pretty(result)?;
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
