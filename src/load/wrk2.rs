use crate::cancel::CancelSignal;
use crate::error::{ExpfError, Result};
use crate::load::adapter::{LoadGenerator, ToolCore};
use crate::load::options::{RequestOverrides, ToolOptions};
use crate::load::probe::ProbePolicy;
use crate::load::process::ProcessHandle;
use crate::load::result::ToolResult;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

pub const NAME: &str = "wrk2";
pub const DEFAULT_RATE: u32 = 2000;
const DEFAULT_THREADS: u32 = 4;
const DISTRIBUTION_HEADER: &str = "Latency Distribution (HdrHistogram - Recorded Latency)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentilePoint {
    pub percentile: f64,
    pub ms: f64,
}

/// Drives the rate-limited `wrk2` CLI. GET only, no bodies.
#[derive(Debug)]
pub struct Wrk2 {
    core: ToolCore,
}

impl Wrk2 {
    pub fn new(options: ToolOptions, cancel: CancelSignal) -> Self {
        Self::with_program(vec![NAME.to_string()], options, cancel)
    }

    pub fn with_program(program: Vec<String>, options: ToolOptions, cancel: CancelSignal) -> Self {
        Self {
            core: ToolCore::new(NAME, program, options, &["-h"], ProbePolicy::Spawnable, cancel),
        }
    }

    pub fn core(&self) -> &ToolCore {
        &self.core
    }

    pub fn build_args(options: &ToolOptions) -> Result<Vec<String>> {
        if !options.method.eq_ignore_ascii_case("GET") {
            return Err(ExpfError::UnsupportedOption {
                tool: NAME,
                option: format!("method {}", options.method),
            });
        }
        if options.body.is_some() {
            return Err(ExpfError::UnsupportedOption {
                tool: NAME,
                option: "request bodies".to_string(),
            });
        }

        let threads = options
            .connections
            .min(super::available_parallelism().unwrap_or(DEFAULT_THREADS));
        let mut args = vec![
            "-d".to_string(),
            format!("{}s", options.duration),
            "-c".to_string(),
            options.connections.to_string(),
            "-R".to_string(),
            options.rate.unwrap_or(DEFAULT_RATE).to_string(),
            "-t".to_string(),
            threads.to_string(),
            "--latency".to_string(),
        ];
        for (key, value) in &options.headers {
            args.push("-H".to_string());
            args.push(format!("{}: {}", key, value));
        }
        args.push(options.url.clone());
        Ok(args)
    }

    pub fn parse_output(options: &ToolOptions, stdout: &str) -> Result<ToolResult> {
        let points = parse_distribution(stdout).ok_or_else(|| ExpfError::ToolOutputUnparseable {
            executable: NAME.to_string(),
            reason: "no latency distribution in output".to_string(),
            stdout: stdout.to_string(),
        })?;

        let requests_per_second = capture_f64(requests_regex(), stdout);
        let average_latency_ms = thread_latency_regex()
            .captures(stdout)
            .and_then(|c| Some(to_ms(c[1].parse().ok()?, &c[2])));
        let non_2xx = capture_f64(non_2xx_regex(), stdout).unwrap_or(0.0) as u64;
        let socket_errors: u64 = socket_errors_regex()
            .captures(stdout)
            .map(|c| {
                (1..=4)
                    .filter_map(|i| c.get(i)?.as_str().parse::<u64>().ok())
                    .sum()
            })
            .unwrap_or(0);

        let mut result = ToolResult::new(NAME, &options.method, &options.url);
        result.average_latency_ms = average_latency_ms;
        result.requests_per_second = requests_per_second;
        result.errors = Some(non_2xx + socket_errors);
        result.raw = serde_json::json!({
            "latencyDistribution": points,
            "requestsPerSecond": requests_per_second,
            "output": stdout,
        });
        Ok(result)
    }
}

/// Percentile points of the HdrHistogram block. The block ends at a blank
/// line or at the detailed spectrum.
pub fn parse_distribution(output: &str) -> Option<Vec<PercentilePoint>> {
    let start = output.find(DISTRIBUTION_HEADER)? + DISTRIBUTION_HEADER.len();
    let points: Vec<PercentilePoint> = output[start..]
        .lines()
        .skip_while(|line| line.trim().is_empty())
        .take_while(|line| {
            !line.trim().is_empty() && !line.trim_start().starts_with("Detailed Percentile spectrum")
        })
        .filter_map(|line| {
            let captures = percentile_regex().captures(line)?;
            let percentile: f64 = captures[1].parse().ok()?;
            let value: f64 = captures[2].parse().ok()?;
            let ms = to_ms(value, &captures[3]);
            (percentile.is_finite() && ms.is_finite()).then_some(PercentilePoint { percentile, ms })
        })
        .collect();

    (!points.is_empty()).then_some(points)
}

fn to_ms(value: f64, unit: &str) -> f64 {
    match unit {
        "us" => value / 1000.0,
        "s" => value * 1000.0,
        _ => value,
    }
}

fn capture_f64(regex: &Regex, text: &str) -> Option<f64> {
    regex.captures(text)?.get(1)?.as_str().parse().ok()
}

fn percentile_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d{1,3}\.\d{3})%\s+([0-9.]+)\s*(us|ms|s)\s*$").unwrap())
}

fn requests_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Requests/sec:\s+([0-9.]+)").unwrap())
}

fn thread_latency_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Latency\s+([0-9.]+)(us|ms|s)\s").unwrap())
}

fn non_2xx_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Non-2xx or 3xx responses:\s+(\d+)").unwrap())
}

fn socket_errors_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Socket errors: connect (\d+), read (\d+), write (\d+), timeout (\d+)").unwrap()
    })
}

#[async_trait]
impl LoadGenerator for Wrk2 {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self, request: &RequestOverrides) -> Result<ToolResult> {
        let options = self.core.options(request)?;
        // A missing wrk2 is a soft failure, even for requests it cannot express.
        self.core.ensure_present().await?;
        let command = self.core.command().args(Self::build_args(&options)?);

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
