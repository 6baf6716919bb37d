//! Shared deterministic types for the pipeline core.
//!
//! These types define stable contracts between the stage executor, the
//! orchestrator and the reporter. They hold no I/O handles and serialize into
//! the `--json` run summary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::core::strategy::{ExecutionStrategy, ModeKind};

/// Identity of a pipeline step, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    TypeCheck,
    /// Package publish dry run.
    JsrCheck,
    TestExecution,
    LintCheck,
    FormatCheck,
    /// Maintenance step that regenerates the toolchain lock file.
    LockfileInit,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::TypeCheck => "type-check",
            StageName::JsrCheck => "jsr-check",
            StageName::TestExecution => "test-execution",
            StageName::LintCheck => "lint-check",
            StageName::FormatCheck => "format-check",
            StageName::LockfileInit => "lockfile-init",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline step together with the inputs it runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiStage {
    TypeCheck {
        files: Vec<PathBuf>,
        hierarchy: Option<PathBuf>,
    },
    /// Always whole-project; never planned when a hierarchy is targeted.
    JsrCheck { allow_dirty: bool },
    TestExecution {
        files: Vec<PathBuf>,
        strategy: ExecutionStrategy,
    },
    LintCheck {
        files: Vec<PathBuf>,
        hierarchy: Option<PathBuf>,
    },
    FormatCheck {
        files: Vec<PathBuf>,
        hierarchy: Option<PathBuf>,
    },
    LockfileInit { files: Vec<PathBuf> },
}

impl CiStage {
    pub fn name(&self) -> StageName {
        match self {
            CiStage::TypeCheck { .. } => StageName::TypeCheck,
            CiStage::JsrCheck { .. } => StageName::JsrCheck,
            CiStage::TestExecution { .. } => StageName::TestExecution,
            CiStage::LintCheck { .. } => StageName::LintCheck,
            CiStage::FormatCheck { .. } => StageName::FormatCheck,
            CiStage::LockfileInit { .. } => StageName::LockfileInit,
        }
    }

    /// Hierarchy the stage was scoped to, if any.
    pub fn hierarchy(&self) -> Option<&Path> {
        match self {
            CiStage::TypeCheck { hierarchy, .. }
            | CiStage::LintCheck { hierarchy, .. }
            | CiStage::FormatCheck { hierarchy, .. } => hierarchy.as_deref(),
            CiStage::TestExecution { strategy, .. } => strategy.hierarchy(),
            CiStage::JsrCheck { .. } | CiStage::LockfileInit { .. } => None,
        }
    }
}

/// Raw outcome of one external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    pub success: bool,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl ProcessResult {
    /// Stdout followed by stderr, as the classifier sees it.
    pub fn combined_output(&self) -> String {
        let mut buf = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        buf.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() {
            buf.push('\n');
        }
        buf.push_str(&self.stderr);
        buf
    }
}

/// Coarse category of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    TypeCheckError,
    TestFailure,
    #[serde(rename = "JSRError")]
    JsrError,
    FormatError,
    LintError,
    ConfigurationError,
    FileSystemError,
    ProcessError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TypeCheckError => "TypeCheckError",
            ErrorKind::TestFailure => "TestFailure",
            ErrorKind::JsrError => "JSRError",
            ErrorKind::FormatError => "FormatError",
            ErrorKind::LintError => "LintError",
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::FileSystemError => "FileSystemError",
            ErrorKind::ProcessError => "ProcessError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified stage failure.
///
/// Output-bearing variants carry the files implicated by the failure (sorted,
/// unique) and the raw tool output they were derived from.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CiError {
    #[error("type check failed")]
    TypeCheck { files: Vec<PathBuf>, detail: String },
    #[error("tests failed")]
    TestFailure { files: Vec<PathBuf>, detail: String },
    #[error("package publish check failed")]
    Jsr { files: Vec<PathBuf>, detail: String },
    #[error("format check failed")]
    Format { files: Vec<PathBuf>, detail: String },
    #[error("lint check failed")]
    Lint { files: Vec<PathBuf>, detail: String },
    #[error("configuration error: {detail}")]
    Configuration { detail: String },
    #[error("command failed")]
    FileSystem { files: Vec<PathBuf>, detail: String },
    /// The tool could not be run to completion (spawn failure, timeout).
    #[error("could not run `{command}`: {detail}")]
    Process { command: String, detail: String },
}

impl CiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CiError::TypeCheck { .. } => ErrorKind::TypeCheckError,
            CiError::TestFailure { .. } => ErrorKind::TestFailure,
            CiError::Jsr { .. } => ErrorKind::JsrError,
            CiError::Format { .. } => ErrorKind::FormatError,
            CiError::Lint { .. } => ErrorKind::LintError,
            CiError::Configuration { .. } => ErrorKind::ConfigurationError,
            CiError::FileSystem { .. } => ErrorKind::FileSystemError,
            CiError::Process { .. } => ErrorKind::ProcessError,
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        match self {
            CiError::TypeCheck { files, .. }
            | CiError::TestFailure { files, .. }
            | CiError::Jsr { files, .. }
            | CiError::Format { files, .. }
            | CiError::Lint { files, .. }
            | CiError::FileSystem { files, .. } => files,
            CiError::Configuration { .. } | CiError::Process { .. } => &[],
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            CiError::TypeCheck { detail, .. }
            | CiError::TestFailure { detail, .. }
            | CiError::Jsr { detail, .. }
            | CiError::Format { detail, .. }
            | CiError::Lint { detail, .. }
            | CiError::Configuration { detail }
            | CiError::FileSystem { detail, .. }
            | CiError::Process { detail, .. } => detail,
        }
    }

    /// Replace the attributed file list, keeping the category and detail.
    ///
    /// Variants without a file list are returned unchanged.
    pub fn with_files(self, new_files: Vec<PathBuf>) -> Self {
        match self {
            CiError::TypeCheck { detail, .. } => CiError::TypeCheck {
                files: new_files,
                detail,
            },
            CiError::TestFailure { detail, .. } => CiError::TestFailure {
                files: new_files,
                detail,
            },
            CiError::Jsr { detail, .. } => CiError::Jsr {
                files: new_files,
                detail,
            },
            CiError::Format { detail, .. } => CiError::Format {
                files: new_files,
                detail,
            },
            CiError::Lint { detail, .. } => CiError::Lint {
                files: new_files,
                detail,
            },
            CiError::FileSystem { detail, .. } => CiError::FileSystem {
                files: new_files,
                detail,
            },
            other @ (CiError::Configuration { .. } | CiError::Process { .. }) => other,
        }
    }
}

/// What a diagnostic fallback run found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FallbackOutcome {
    /// The failure reproduced at finer granularity in these files.
    Reproduced { files: Vec<PathBuf> },
    /// Every partition passed when re-run on its own.
    NotReproduced,
}

/// One step of the diagnostic fallback trail for a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackStep {
    pub mode: ModeKind,
    /// Number of files the narrowed run was restricted to.
    pub scope: usize,
    #[serde(flatten)]
    pub outcome: FallbackOutcome,
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageResult {
    Success {
        stage: StageName,
        #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
        duration: Duration,
        files_processed: usize,
    },
    Failure {
        stage: StageName,
        error: CiError,
        #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
        duration: Duration,
        fallback: Vec<FallbackStep>,
    },
    Skipped {
        stage: StageName,
        reason: String,
    },
}

impl StageResult {
    pub fn stage(&self) -> StageName {
        match self {
            StageResult::Success { stage, .. }
            | StageResult::Failure { stage, .. }
            | StageResult::Skipped { stage, .. } => *stage,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageResult::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StageResult::Failure { .. })
    }

    /// Failures always halt the run; there is no partial-continue mode.
    pub fn should_stop(&self) -> bool {
        self.is_failure()
    }

    pub fn error(&self) -> Option<&CiError> {
        match self {
            StageResult::Failure { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn serialize_millis<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(millis(*duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturates_instead_of_wrapping() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn with_files_keeps_category_and_detail() {
        let err = CiError::TestFailure {
            files: vec![PathBuf::from("a_test.ts"), PathBuf::from("b_test.ts")],
            detail: "boom".to_string(),
        };
        let narrowed = err.with_files(vec![PathBuf::from("b_test.ts")]);
        assert_eq!(narrowed.kind(), ErrorKind::TestFailure);
        assert_eq!(narrowed.files(), &[PathBuf::from("b_test.ts")]);
        assert_eq!(narrowed.detail(), "boom");
    }

    #[test]
    fn with_files_ignores_process_errors() {
        let err = CiError::Process {
            command: "deno test".to_string(),
            detail: "not found".to_string(),
        };
        let same = err.clone().with_files(vec![PathBuf::from("x.ts")]);
        assert_eq!(same, err);
        assert!(same.files().is_empty());
    }

    #[test]
    fn failure_always_stops() {
        let failure = StageResult::Failure {
            stage: StageName::LintCheck,
            error: CiError::Lint {
                files: Vec::new(),
                detail: String::new(),
            },
            duration: Duration::ZERO,
            fallback: Vec::new(),
        };
        let skipped = StageResult::Skipped {
            stage: StageName::TestExecution,
            reason: "no test files found".to_string(),
        };
        assert!(failure.should_stop());
        assert!(!skipped.should_stop());
    }

    #[test]
    fn combined_output_joins_streams() {
        let result = ProcessResult {
            success: false,
            exit_code: Some(1),
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            duration: Duration::ZERO,
        };
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[test]
    fn stage_result_serializes_with_status_tag() {
        let result = StageResult::Success {
            stage: StageName::TypeCheck,
            duration: Duration::from_millis(1500),
            files_processed: 3,
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["status"], "success");
        assert_eq!(value["stage"], "type-check");
        assert_eq!(value["duration_ms"], 1500);
    }
}
