//! Stable exit codes for the `ci-runner` binary.

/// Every planned stage passed or was skipped (also `--help`/`--version`).
pub const OK: i32 = 0;
/// A stage failed, or arguments/config/discovery were invalid.
pub const FAILED: i32 = 1;
