//! Local CI pipeline runner for a Deno-style toolchain.
//!
//! A run is a fixed sequence of quality gates (type check, package publish
//! dry run, tests, lint, format) executed against the whole project or one
//! directory hierarchy. Tests can run all at once, in batches or file by file;
//! when a coarse run fails, a diagnostic fallback re-runs at finer granularity
//! to pinpoint the failing files. The architecture enforces a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (strategies, fallback policy,
//!   output classification, argument building). No I/O.
//! - **[`io`]**: Side effects (config files, discovery, process execution),
//!   behind the [`io::invoker::ToolInvoker`] seam.
//!
//! [`executor`] drives one stage; [`pipeline`] sequences stages and
//! [`report`] renders the outcome.

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
