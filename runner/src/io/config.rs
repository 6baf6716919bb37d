//! Runner configuration read from `ci-runner.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::strategy::ValidationError;
use crate::io::invoker::DEFAULT_OUTPUT_LIMIT_BYTES;

pub const CONFIG_FILE_NAME: &str = "ci-runner.toml";

/// Runner configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults
/// below. CLI flags override the loaded values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Toolchain binary invoked for every stage.
    pub tool: String,

    /// Per-invocation timeout in seconds. `0` disables the timeout.
    pub timeout_secs: u64,

    /// Bytes of stdout/stderr kept in memory per invocation.
    pub output_limit_bytes: usize,

    /// Lock file removed by `--lockfile-init`, relative to the working directory.
    pub lock_file: String,

    pub discovery: DiscoveryConfig,

    pub stages: StageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// File name endings that mark a test file.
    pub test_suffixes: Vec<String>,
    /// Extensions (without the dot) of source files.
    pub source_extensions: Vec<String>,
    /// Directory names never descended into.
    pub ignore_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageConfig {
    /// Flags passed to `test` before the file arguments.
    pub test_args: Vec<String>,
    /// Pass `--allow-dirty` to the publish dry run.
    pub jsr_allow_dirty: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            test_suffixes: [
                "_test.ts", ".test.ts", "_test.tsx", ".test.tsx", "_test.js", ".test.js",
                "_test.mts", ".test.mts",
            ]
            .map(String::from)
            .to_vec(),
            source_extensions: ["ts", "tsx", "js", "jsx", "mts", "mjs"]
                .map(String::from)
                .to_vec(),
            ignore_dirs: ["node_modules", ".git", "coverage", "dist", "vendor", "npm"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            test_args: vec!["--allow-all".to_string()],
            jsr_allow_dirty: true,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tool: "deno".to_string(),
            timeout_secs: 10 * 60,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            lock_file: "deno.lock".to_string(),
            discovery: DiscoveryConfig::default(),
            stages: StageConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tool.trim().is_empty() {
            return Err(ValidationError::Empty { field: "tool" });
        }
        if self.output_limit_bytes == 0 {
            return Err(ValidationError::OutOfRange {
                field: "output_limit_bytes",
                value: 0,
                min: 1,
                max: usize::MAX,
            });
        }
        if self.lock_file.trim().is_empty() {
            return Err(ValidationError::Empty { field: "lock_file" });
        }
        if self.discovery.test_suffixes.is_empty() {
            return Err(ValidationError::Empty {
                field: "discovery.test_suffixes",
            });
        }
        if self.discovery.source_extensions.is_empty() {
            return Err(ValidationError::Empty {
                field: "discovery.source_extensions",
            });
        }
        for suffix in &self.discovery.test_suffixes {
            if !suffix.contains('.') || suffix.chars().any(char::is_whitespace) {
                return Err(ValidationError::PatternMismatch {
                    field: "discovery.test_suffixes",
                    value: suffix.clone(),
                    expected: "a file name ending such as `_test.ts`",
                });
            }
        }
        for ext in &self.discovery.source_extensions {
            if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ValidationError::PatternMismatch {
                    field: "discovery.source_extensions",
                    value: ext.clone(),
                    expected: "an extension without the leading dot",
                });
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    debug!(path = %path.display(), tool = %cfg.tool, "config loaded");
    Ok(cfg)
}
