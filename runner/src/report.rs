//! Final run report on stdout, shaped by the [`LogMode`].

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::types::{FallbackOutcome, StageResult};
use crate::logging::LogMode;
use crate::pipeline::RunSummary;

/// Tail of the tool output shown for a failure outside debug mode.
pub const DETAIL_TAIL_LINES: usize = 20;

/// Write the human-readable report for `summary`.
pub fn render(summary: &RunSummary, mode: LogMode, out: &mut impl Write) -> io::Result<()> {
    match mode {
        LogMode::Silent => Ok(()),
        LogMode::ErrorFilesOnly => {
            for file in failing_files(summary) {
                writeln!(out, "{}", file.display())?;
            }
            Ok(())
        }
        LogMode::Normal | LogMode::Debug => {
            for result in &summary.results {
                render_stage(result, mode, out)?;
            }
            render_footer(summary, out)
        }
    }
}

/// Write `summary` as pretty JSON followed by a newline.
pub fn render_json(summary: &RunSummary, out: &mut impl Write) -> Result<()> {
    let payload = serde_json::to_string_pretty(summary).context("serialize run summary")?;
    writeln!(out, "{payload}").context("write run summary")?;
    Ok(())
}

/// Files implicated by the failing stage, if the run failed.
pub fn failing_files(summary: &RunSummary) -> Vec<PathBuf> {
    summary
        .failed_stage()
        .and_then(StageResult::error)
        .map(|err| err.files().to_vec())
        .unwrap_or_default()
}

fn render_stage(result: &StageResult, mode: LogMode, out: &mut impl Write) -> io::Result<()> {
    match result {
        StageResult::Success {
            stage,
            duration,
            files_processed,
        } => writeln!(
            out,
            "PASS {stage} ({}, {files_processed} files)",
            seconds(*duration)
        ),
        StageResult::Skipped { stage, reason } => writeln!(out, "SKIP {stage}: {reason}"),
        StageResult::Failure {
            stage,
            error,
            duration,
            fallback,
        } => {
            writeln!(out, "FAIL {stage} ({}): {}", seconds(*duration), error.kind())?;
            for file in error.files() {
                writeln!(out, "  - {}", file.display())?;
            }
            for step in fallback {
                match &step.outcome {
                    FallbackOutcome::Reproduced { files } => writeln!(
                        out,
                        "  fallback {} over {} files: reproduced in {} files",
                        step.mode,
                        step.scope,
                        files.len()
                    )?,
                    FallbackOutcome::NotReproduced => writeln!(
                        out,
                        "  fallback {} over {} files: not reproduced",
                        step.mode, step.scope
                    )?,
                }
            }
            let detail = error.detail();
            if !detail.is_empty() {
                writeln!(out, "{}", detail_excerpt(detail, mode))?;
            }
            Ok(())
        }
    }
}

fn render_footer(summary: &RunSummary, out: &mut impl Write) -> io::Result<()> {
    let elapsed = seconds(summary.duration);
    match summary.failed_stage() {
        Some(failed) => {
            let kind = failed
                .error()
                .map(|err| err.kind().as_str())
                .unwrap_or("unknown");
            writeln!(
                out,
                "pipeline failed at {} ({kind}) after {elapsed}",
                failed.stage()
            )
        }
        None => writeln!(
            out,
            "pipeline passed in {elapsed}: {} stages passed, {} skipped, {} source files, {} test files",
            summary.passed_count(),
            summary.skipped_count(),
            summary.files.source,
            summary.files.test
        ),
    }
}

fn detail_excerpt(detail: &str, mode: LogMode) -> String {
    if mode == LogMode::Debug {
        return detail.trim_end().to_string();
    }
    let lines: Vec<&str> = detail.trim_end().lines().collect();
    let start = lines.len().saturating_sub(DETAIL_TAIL_LINES);
    lines[start..].join("\n")
}

fn seconds(duration: Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}
