//! Run report rendering.

use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;

use install_orchestrator::{CellResult, CellStatus, ResultSet, Summary};

use crate::output::{self, print_data, section};
use crate::OutputFormat;

#[derive(Debug, Serialize, Tabled)]
struct ResultRow {
    #[tabled(rename = "Distribution")]
    distribution: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Arch")]
    architecture: String,
    #[tabled(rename = "Libc")]
    libc: String,
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

impl From<&CellResult> for ResultRow {
    fn from(result: &CellResult) -> Self {
        Self {
            distribution: result.cell.distribution.clone(),
            version: result.cell.version.clone(),
            architecture: result.cell.architecture.to_string(),
            libc: result.cell.libc.to_string(),
            identity: result.cell.identity.to_string(),
            status: status_label(result.status).to_string(),
            duration: format_duration(result.duration_ms),
            reason: result.reason().unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct DistributionRow {
    #[tabled(rename = "Distribution")]
    distribution: String,
    #[tabled(rename = "Total")]
    total: usize,
    #[tabled(rename = "Passed")]
    passed: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "Skipped")]
    skipped: usize,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    summary: Summary,
    results: Vec<&'a CellResult>,
}

fn status_label(status: CellStatus) -> &'static str {
    match status {
        CellStatus::Pass => "pass",
        CellStatus::Fail => "FAIL",
        CellStatus::Skipped => "skipped",
    }
}

fn format_duration(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

/// Print the report for a finished run.
pub fn render(results: &ResultSet, format: OutputFormat) -> anyhow::Result<()> {
    let summary = results.summarize();

    if format == OutputFormat::Json {
        let report = JsonReport {
            summary,
            results: results.sorted(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    section("Results");
    let rows: Vec<ResultRow> = results.sorted().into_iter().map(ResultRow::from).collect();
    print_data(&rows, format)?;

    let failed: Vec<&CellResult> = results
        .sorted()
        .into_iter()
        .filter(|r| r.status == CellStatus::Fail)
        .collect();
    if !failed.is_empty() {
        section("Failures");
        for result in failed {
            print_failure(result);
        }
    }

    section("Summary");
    let per_distribution: Vec<DistributionRow> = summary
        .per_distribution
        .iter()
        .map(|(distribution, counts)| DistributionRow {
            distribution: distribution.clone(),
            total: counts.total,
            passed: counts.passed,
            failed: counts.failed,
            skipped: counts.skipped,
        })
        .collect();
    print_data(&per_distribution, format)?;

    let line = format!(
        "{} cell(s): {} passed, {} failed, {} skipped",
        summary.total, summary.passed, summary.failed, summary.skipped
    );
    if summary.failed == 0 {
        output::success(&line);
    } else {
        output::error(&line);
    }
    Ok(())
}

fn print_failure(result: &CellResult) {
    println!();
    println!(
        "{} {} {}",
        "✗".red().bold(),
        result.cell.label().bold(),
        result.reason().unwrap_or_default().red()
    );
    if let Some(container) = &result.container {
        println!("  {} {}", "container:".dimmed(), container);
    }

    for (phase, step) in result.failed_steps() {
        let exit = step
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "not dispatched".to_string());
        println!(
            "  {} {} {} (exit {})",
            "→".blue(),
            phase.identity,
            step.name.cyan(),
            exit
        );
        println!("    {} {}", "$".dimmed(), step.command.dimmed());
        print_stream("stdout", &step.stdout);
        print_stream("stderr", &step.stderr);
    }

    if let Some(diagnostics) = result.failure.as_ref().and_then(|f| f.diagnostics.as_deref()) {
        print_stream("diagnostics", diagnostics);
    }
}

fn print_stream(name: &str, text: &str) {
    let text = text.trim_end();
    if text.is_empty() {
        return;
    }
    println!("    {}", format!("{name}:").dimmed());
    for line in text.lines() {
        println!("      {}", line);
    }
}

/// Write the full result set as JSON.
pub fn write_results_file(path: &Path, results: &ResultSet) -> anyhow::Result<()> {
    let report = JsonReport {
        summary: results.summarize(),
        results: results.sorted(),
    };
    let json = serde_json::to_vec_pretty(&report).context("failed to serialize results")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write results file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use install_orchestrator::{CellFailure, FailureKind, Stage};
    use matrix_shared_types::{Architecture, Identity, LibcVariant, MatrixCell};

    fn failed_result() -> CellResult {
        CellResult::failed(
            MatrixCell {
                distribution: "alpine".to_string(),
                version: "3.19".to_string(),
                architecture: Architecture::Aarch64,
                libc: LibcVariant::Musl,
                identity: Identity::User,
            },
            CellFailure::new(FailureKind::UserInstallError, Stage::UserPhase, "user install step exited with 1"),
        )
    }

    #[test]
    fn test_row_from_failed_result() {
        let row = ResultRow::from(&failed_result());
        assert_eq!(row.status, "FAIL");
        assert_eq!(row.architecture, "aarch64");
        assert_eq!(row.identity, "user");
        assert!(row.reason.starts_with("UserInstallError"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(125_000), "2m05s");
    }

    #[test]
    fn test_results_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut results = ResultSet::new();
        results.record(failed_result());

        write_results_file(&path, &results).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["summary"]["failed"], 1);
        assert_eq!(json["results"][0]["failure"]["kind"], "UserInstallError");
    }

    #[test]
    fn test_results_file_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("results.json");

        let err = write_results_file(&path, &ResultSet::new()).unwrap_err();
        assert!(err.to_string().contains("missing/results.json"));
    }
}
