//! Side-by-side comparison of two runs' client results.

use crate::load::ToolResult;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Relative change below which a metric counts as unchanged.
pub const DEFAULT_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Improved,
    Regressed,
    Unchanged,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Improved => "improved",
            Verdict::Regressed => "regressed",
            Verdict::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Better {
    Lower,
    Higher,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricComparison {
    pub metric: &'static str,
    pub baseline: f64,
    pub candidate: f64,
    pub difference: f64,
    /// `candidate / baseline`; absent when the baseline is zero.
    pub ratio: Option<f64>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorComparison {
    pub tool: String,
    pub method: String,
    pub path: String,
    pub metrics: Vec<MetricComparison>,
}

impl GeneratorComparison {
    pub fn label(&self) -> String {
        format!("{} {} {}", self.tool, self.method, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub tolerance: f64,
    pub generators: Vec<GeneratorComparison>,
    /// Results present in only one of the two runs.
    pub unmatched: Vec<String>,
}

impl Comparison {
    pub fn has_regressions(&self) -> bool {
        self.generators
            .iter()
            .flat_map(|g| g.metrics.iter())
            .any(|m| m.verdict == Verdict::Regressed)
    }
}

/// The `clientResults` of a saved run, or a bare array of results.
pub fn client_results(document: &Value) -> serde_json::Result<Vec<ToolResult>> {
    let results = document.get("clientResults").unwrap_or(document);
    serde_json::from_value(results.clone())
}

fn key(result: &ToolResult) -> (String, String, String) {
    let path = url::Url::parse(&result.url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| result.url.clone());
    (result.tool.clone(), result.method.clone(), path)
}

/// Match results by generator, method and request path, then compare each
/// metric both runs report.
pub fn compare_results(baseline: &[ToolResult], candidate: &[ToolResult], tolerance: f64) -> Comparison {
    let mut generators = Vec::new();
    let mut unmatched = Vec::new();

    for base in baseline {
        let (tool, method, path) = key(base);
        let Some(other) = candidate.iter().find(|c| key(c) == (tool.clone(), method.clone(), path.clone())) else {
            unmatched.push(format!("{} {} {}", tool, method, path));
            continue;
        };

        let metrics = [
            ("averageLatencyMs", base.average_latency_ms, other.average_latency_ms, Better::Lower),
            ("requestsPerSecond", base.requests_per_second, other.requests_per_second, Better::Higher),
            (
                "errors",
                base.errors.map(|e| e as f64),
                other.errors.map(|e| e as f64),
                Better::Lower,
            ),
        ]
        .into_iter()
        .filter_map(|(metric, before, after, better)| {
            Some(compare_metric(metric, before?, after?, better, tolerance))
        })
        .collect();

        generators.push(GeneratorComparison {
            tool,
            method,
            path,
            metrics,
        });
    }

    for other in candidate {
        let other_key = key(other);
        if !baseline.iter().any(|b| key(b) == other_key) {
            let (tool, method, path) = other_key;
            unmatched.push(format!("{} {} {}", tool, method, path));
        }
    }

    Comparison {
        tolerance,
        generators,
        unmatched,
    }
}

fn compare_metric(metric: &'static str, baseline: f64, candidate: f64, better: Better, tolerance: f64) -> MetricComparison {
    let difference = candidate - baseline;
    let ratio = (baseline != 0.0).then(|| candidate / baseline);

    let significant = match ratio {
        Some(ratio) => (ratio - 1.0).abs() > tolerance,
        None => candidate != 0.0,
    };
    let verdict = if !significant {
        Verdict::Unchanged
    } else if (difference < 0.0) == (better == Better::Lower) {
        Verdict::Improved
    } else {
        Verdict::Regressed
    };

    MetricComparison {
        metric,
        baseline,
        candidate,
        difference,
        ratio,
        verdict,
    }
}
