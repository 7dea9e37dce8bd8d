use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::adapter::{LoadGenerator, ToolCore};
use crate::load::options::{RequestOverrides, ToolOptions};
use crate::load::probe::ProbePolicy;
use crate::load::process::{platform_executable, ProcessHandle};
use crate::load::result::ToolResult;
use async_trait::async_trait;
use serde_json::Value;

pub const NAME: &str = "autocannon";
const DEFAULT_WORKERS: u32 = 8;

/// Drives the `autocannon` CLI in JSON mode.
#[derive(Debug)]
pub struct Autocannon {
    core: ToolCore,
}

impl Autocannon {
    pub fn new(options: ToolOptions, cancel: CancelSignal) -> Self {
        Self::with_program(vec![platform_executable(NAME)], options, cancel)
    }

    /// Use `program` (an executable plus leading arguments) instead of `autocannon`.
    pub fn with_program(program: Vec<String>, options: ToolOptions, cancel: CancelSignal) -> Self {
        Self {
            core: ToolCore::new(NAME, program, options, &["-h"], ProbePolicy::ExitZero, cancel),
        }
    }

    pub fn core(&self) -> &ToolCore {
        &self.core
    }

    pub fn build_args(options: &ToolOptions) -> Vec<String> {
        let workers = options
            .connections
            .min(super::available_parallelism().unwrap_or(DEFAULT_WORKERS));

        let mut args = vec![
            "-d".to_string(),
            options.duration.to_string(),
            "-c".to_string(),
            options.connections.to_string(),
            "-w".to_string(),
            workers.to_string(),
            "-j".to_string(),
            "-n".to_string(),
            "-m".to_string(),
            options.method.clone(),
        ];
        if let Some(body) = &options.body {
            args.push("-b".to_string());
            args.push(body.to_payload());
        }
        for (key, value) in &options.headers {
            args.push("-H".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }

    pub fn parse_output(options: &ToolOptions, stdout: &str) -> Result<ToolResult> {
        let unparseable = |reason: String| ExpfError::ToolOutputUnparseable {
            executable: NAME.to_string(),
            reason,
            stdout: stdout.to_string(),
        };

        let raw: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| unparseable(format!("invalid JSON: {}", e)))?;
        if !raw.is_object() {
            return Err(unparseable("expected a JSON object".to_string()));
        }

        let mut result = ToolResult::new(NAME, &options.method, &options.url);
        result.average_latency_ms = raw.pointer("/latency/average").and_then(Value::as_f64);
        result.requests_per_second = raw.pointer("/requests/average").and_then(Value::as_f64);
        result.errors = raw.get("errors").and_then(Value::as_u64);
        result.raw = raw;
        Ok(result)
    }
}

#[async_trait]
impl LoadGenerator for Autocannon {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self, request: &RequestOverrides) -> Result<ToolResult> {
        let options = self.core.options(request)?;
        let command = self
            .core
            .command()
            .args(Self::build_args(&options))
            .trailing(options.url.clone());

        let output = self.core.execute(command).await?;
        Self::parse_output(&options, &output.stdout)
    }

    fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }

    fn processes(&self) -> Vec<ProcessHandle> {
        self.core.registry().snapshot()
    }
}
