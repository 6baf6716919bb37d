//! Diagnostic tracing and the user-facing log mode.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: progress and diagnostics on stderr, filtered by
//!   `RUST_LOG` or, when unset, by the [`LogMode`].
//! - **Reporting (`report`)**: the final run report on stdout, shaped by the
//!   same [`LogMode`].

use std::fmt;

use clap::ValueEnum;
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Verbosity selected on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogMode {
    /// Stage progress plus the run report.
    #[default]
    Normal,
    /// Nothing but the exit code.
    Silent,
    /// Everything, including full tool output of failures.
    Debug,
    /// Only the paths implicated in a failure, one per line.
    ErrorFilesOnly,
}

impl LogMode {
    /// Default tracing directive when `RUST_LOG` is unset.
    pub fn default_directive(self) -> &'static str {
        match self {
            LogMode::Normal => "info",
            LogMode::Debug => "debug",
            LogMode::Silent | LogMode::ErrorFilesOnly => "error",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogMode::Normal => "normal",
            LogMode::Silent => "silent",
            LogMode::Debug => "debug",
            LogMode::ErrorFilesOnly => "error-files-only",
        }
    }
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the filter follows `mode`.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=ci_runner=trace ci-runner --mode batch
/// ```
pub fn init(mode: LogMode) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(mode.default_directive()));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
