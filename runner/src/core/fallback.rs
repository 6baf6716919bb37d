//! Fallback policy: when a failed stage is re-run at finer granularity.
//!
//! Fallback is diagnostic. It narrows down which files trigger a failure and
//! never turns a failed stage into a passing one.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::strategy::{ExecutionStrategy, ModeKind, ValidationError};
use crate::core::types::CiError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FallbackError {
    #[error("no fallback mode after {mode}")]
    Exhausted { mode: ModeKind },
    #[error("invalid fallback strategy: {0}")]
    Invalid(#[from] ValidationError),
}

/// Decide whether `error` justifies a finer-grained re-run under `strategy`.
///
/// Only test failures qualify: static checks report the same output however
/// the files are batched.
pub fn should_fallback(strategy: &ExecutionStrategy, error: &CiError) -> bool {
    match error {
        CiError::TestFailure { .. } => {
            strategy.fallback_enabled() && strategy.kind() != ModeKind::SingleFile
        }
        CiError::TypeCheck { .. }
        | CiError::Jsr { .. }
        | CiError::Format { .. }
        | CiError::Lint { .. }
        | CiError::Configuration { .. }
        | CiError::FileSystem { .. }
        | CiError::Process { .. } => false,
    }
}

/// Build the next strategy in the chain, keeping fallback and hierarchy settings.
pub fn create_fallback_strategy(
    current: &ExecutionStrategy,
) -> Result<ExecutionStrategy, FallbackError> {
    let next = current
        .next_fallback_mode()
        .ok_or(FallbackError::Exhausted {
            mode: current.kind(),
        })?;
    let strategy = ExecutionStrategy::create(
        next,
        current.fallback_enabled(),
        current.hierarchy().map(PathBuf::from),
    )?;
    Ok(strategy)
}

/// Files a fallback run is restricted to.
///
/// An `all` failure carries no partition signal, so the whole original list is
/// re-run; a `batch` or `single-file` failure narrows to the failed partition.
pub fn fallback_scope(
    failed_mode: ModeKind,
    original_files: &[PathBuf],
    failed_partition: &[PathBuf],
) -> Vec<PathBuf> {
    match failed_mode {
        ModeKind::All => original_files.to_vec(),
        ModeKind::Batch | ModeKind::SingleFile => failed_partition.to_vec(),
    }
}
