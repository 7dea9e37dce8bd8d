use anyhow::{bail, Context, Result};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};

use super::use_color;
use crate::compare::{client_results, compare_results, Comparison, Verdict};
use crate::load::ToolResult;

pub struct CompareArgs {
    pub baseline: PathBuf,
    pub candidate: PathBuf,
    pub tolerance: f64,
    pub json: bool,
    pub fail_on_regression: bool,
}

fn read_results(path: &Path) -> Result<Vec<ToolResult>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let document: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    client_results(&document).with_context(|| format!("No client results in {}", path.display()))
}

pub async fn handle_compare(args: CompareArgs) -> Result<()> {
    if !(0.0..1.0).contains(&args.tolerance) {
        bail!("Tolerance must be in [0, 1), got {}", args.tolerance);
    }
    let baseline = read_results(&args.baseline)?;
    let candidate = read_results(&args.candidate)?;
    let comparison = compare_results(&baseline, &candidate, args.tolerance);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
    } else {
        print_comparison(&comparison);
    }

    if args.fail_on_regression && comparison.has_regressions() {
        bail!("Candidate regressed against {}", args.baseline.display());
    }
    Ok(())
}

fn print_comparison(comparison: &Comparison) {
    let color = use_color();
    for generator in &comparison.generators {
        let label = generator.label();
        if color {
            println!("{}", label.bold());
        } else {
            println!("{}", label);
        }

        for metric in &generator.metrics {
            let ratio = metric
                .ratio
                .map(|r| format!("x{:.3}", r))
                .unwrap_or_else(|| "-".to_string());
            let row = format!(
                "  {:<18} {:>12.2} -> {:>12.2}  ({:+.2}, {})",
                metric.metric, metric.baseline, metric.candidate, metric.difference, ratio
            );
            let verdict = metric.verdict.to_string();
            if color {
                let verdict = match metric.verdict {
                    Verdict::Improved => verdict.green().to_string(),
                    Verdict::Regressed => verdict.red().bold().to_string(),
                    Verdict::Unchanged => verdict.bright_black().to_string(),
                };
                println!("{}  {}", row, verdict);
            } else {
                println!("{}  {}", row, verdict);
            }
        }
    }

    for missing in &comparison.unmatched {
        println!("{} {} is only present in one run", "!".yellow(), missing);
    }
}
