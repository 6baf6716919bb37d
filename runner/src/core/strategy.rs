//! Execution strategies: how a stage partitions its files across invocations.
//!
//! An [`ExecutionStrategy`] can only be obtained through
//! [`ExecutionStrategy::create`], which rejects out-of-range batch sizes and
//! pins the mode's hierarchy to the strategy's own.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 100;
/// Batch size used when `all` degrades to `batch`.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Rejected configuration value. Raised before any stage runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} '{value}' must be {expected}")]
    PatternMismatch {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// How a stage splits its candidate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One invocation over every file (or the hierarchy when no files are given).
    All { hierarchy: Option<PathBuf> },
    /// One invocation per consecutive group of `batch_size` files.
    Batch {
        batch_size: usize,
        hierarchy: Option<PathBuf>,
    },
    /// One invocation per file.
    SingleFile {
        stop_on_first_error: bool,
        hierarchy: Option<PathBuf>,
    },
}

impl ExecutionMode {
    pub fn all() -> Self {
        ExecutionMode::All { hierarchy: None }
    }

    pub fn batch(batch_size: usize) -> Self {
        ExecutionMode::Batch {
            batch_size,
            hierarchy: None,
        }
    }

    pub fn single_file(stop_on_first_error: bool) -> Self {
        ExecutionMode::SingleFile {
            stop_on_first_error,
            hierarchy: None,
        }
    }

    pub fn kind(&self) -> ModeKind {
        match self {
            ExecutionMode::All { .. } => ModeKind::All,
            ExecutionMode::Batch { .. } => ModeKind::Batch,
            ExecutionMode::SingleFile { .. } => ModeKind::SingleFile,
        }
    }

    pub fn hierarchy(&self) -> Option<&Path> {
        match self {
            ExecutionMode::All { hierarchy }
            | ExecutionMode::Batch { hierarchy, .. }
            | ExecutionMode::SingleFile { hierarchy, .. } => hierarchy.as_deref(),
        }
    }

    fn with_hierarchy(self, hierarchy: Option<PathBuf>) -> Self {
        match self {
            ExecutionMode::All { .. } => ExecutionMode::All { hierarchy },
            ExecutionMode::Batch { batch_size, .. } => ExecutionMode::Batch {
                batch_size,
                hierarchy,
            },
            ExecutionMode::SingleFile {
                stop_on_first_error,
                ..
            } => ExecutionMode::SingleFile {
                stop_on_first_error,
                hierarchy,
            },
        }
    }
}

/// Fieldless discriminant of [`ExecutionMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeKind {
    All,
    Batch,
    SingleFile,
}

impl ModeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModeKind::All => "all",
            ModeKind::Batch => "batch",
            ModeKind::SingleFile => "single-file",
        }
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, immutable execution plan for one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStrategy {
    mode: ExecutionMode,
    fallback_enabled: bool,
    hierarchy: Option<PathBuf>,
}

impl ExecutionStrategy {
    /// Validate `mode` and bind it to `hierarchy`.
    ///
    /// Fails with [`ValidationError::OutOfRange`] when a batch size lies
    /// outside `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]`.
    pub fn create(
        mode: ExecutionMode,
        fallback_enabled: bool,
        hierarchy: Option<PathBuf>,
    ) -> Result<Self, ValidationError> {
        if let ExecutionMode::Batch { batch_size, .. } = mode {
            validate_batch_size(batch_size)?;
        }
        Ok(Self {
            mode: mode.with_hierarchy(hierarchy.clone()),
            fallback_enabled,
            hierarchy,
        })
    }

    /// Single whole-scope invocation with fallback disabled.
    ///
    /// Needs no validation: `all` carries no tunable size.
    pub fn whole(hierarchy: Option<PathBuf>) -> Self {
        Self {
            mode: ExecutionMode::All {
                hierarchy: hierarchy.clone(),
            },
            fallback_enabled: false,
            hierarchy,
        }
    }

    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    pub fn kind(&self) -> ModeKind {
        self.mode.kind()
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    pub fn hierarchy(&self) -> Option<&Path> {
        self.hierarchy.as_deref()
    }

    /// Successor in the fixed chain `all -> batch -> single-file`.
    ///
    /// `None` for `single-file`: there is no finer granularity.
    pub fn next_fallback_mode(&self) -> Option<ExecutionMode> {
        let hierarchy = self.hierarchy.clone();
        match self.mode {
            ExecutionMode::All { .. } => Some(ExecutionMode::Batch {
                batch_size: DEFAULT_BATCH_SIZE,
                hierarchy,
            }),
            ExecutionMode::Batch { .. } => Some(ExecutionMode::SingleFile {
                stop_on_first_error: true,
                hierarchy,
            }),
            ExecutionMode::SingleFile { .. } => None,
        }
    }
}

pub fn validate_batch_size(batch_size: usize) -> Result<(), ValidationError> {
    if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&batch_size) {
        return Err(ValidationError::OutOfRange {
            field: "batch_size",
            value: batch_size,
            min: MIN_BATCH_SIZE,
            max: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

/// Files sent to a single invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Position of this partition in run order (0-based).
    pub index: usize,
    /// Index of the first file in the stage's file list.
    pub start: usize,
    /// One past the last file.
    pub end: usize,
    pub files: Vec<PathBuf>,
}

/// Split `files` into the partitions `strategy` invokes, preserving order.
///
/// Takes a validated strategy so the batch size is already within
/// `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]`. An empty file list yields no partitions.
pub fn partition(files: &[PathBuf], strategy: &ExecutionStrategy) -> Vec<Partition> {
    if files.is_empty() {
        return Vec::new();
    }
    let size = match strategy.mode() {
        ExecutionMode::All { .. } => files.len(),
        ExecutionMode::Batch { batch_size, .. } => *batch_size,
        ExecutionMode::SingleFile { .. } => 1,
    };
    files
        .chunks(size)
        .enumerate()
        .map(|(index, chunk)| {
            let start = index * size;
            Partition {
                index,
                start,
                end: start + chunk.len(),
                files: chunk.to_vec(),
            }
        })
        .collect()
}
