//! Pipeline orchestration: plan the stages, run them in order, stop at the
//! first failure.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::commands::command_for;
use crate::core::strategy::ExecutionStrategy;
use crate::core::types::{CiStage, StageResult, millis, serialize_millis};
use crate::executor::{InvokeSettings, StageExecutor};
use crate::io::discovery::ProjectFiles;
use crate::io::invoker::ToolInvoker;

/// Everything a run needs besides the file lists.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Strategy for test execution; its hierarchy scopes the whole run.
    pub strategy: ExecutionStrategy,
    pub test_args: Vec<String>,
    pub jsr_allow_dirty: bool,
    /// Lock file removed by the lockfile maintenance step, relative to `invoke.cwd`.
    pub lock_file: PathBuf,
    pub invoke: InvokeSettings,
}

impl PipelineOptions {
    pub fn hierarchy(&self) -> Option<&Path> {
        self.strategy.hierarchy()
    }
}

/// Per-category count of candidate files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileCounts {
    pub source: usize,
    pub test: usize,
}

impl From<&ProjectFiles> for FileCounts {
    fn from(files: &ProjectFiles) -> Self {
        Self {
            source: files.sources.len(),
            test: files.tests.len(),
        }
    }
}

/// Ordered stage results of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub success: bool,
    pub results: Vec<StageResult>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub files: FileCounts,
}

impl RunSummary {
    /// The stage that halted the run, if any.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.results.iter().find(|result| result.is_failure())
    }

    pub fn failed(&self) -> bool {
        !self.success
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, StageResult::Skipped { .. }))
            .count()
    }
}

/// Plan the fixed stage sequence for a run.
///
/// `type-check -> jsr-check -> test-execution -> lint-check -> format-check`.
/// The publish check is whole-project only, so it is left out entirely when a
/// hierarchy is targeted.
pub fn plan_stages(options: &PipelineOptions, files: &ProjectFiles) -> Vec<CiStage> {
    let hierarchy = options.hierarchy().map(Path::to_path_buf);
    let mut stages = vec![CiStage::TypeCheck {
        files: files.all_sources(),
        hierarchy: hierarchy.clone(),
    }];
    if hierarchy.is_none() {
        stages.push(CiStage::JsrCheck {
            allow_dirty: options.jsr_allow_dirty,
        });
    }
    stages.push(CiStage::TestExecution {
        files: files.tests.clone(),
        strategy: options.strategy.clone(),
    });
    stages.push(CiStage::LintCheck {
        files: Vec::new(),
        hierarchy: hierarchy.clone(),
    });
    stages.push(CiStage::FormatCheck {
        files: Vec::new(),
        hierarchy,
    });
    stages
}

/// Sequential stage runner over a [`ToolInvoker`].
pub struct Pipeline<'a, I: ToolInvoker> {
    invoker: &'a I,
    options: &'a PipelineOptions,
}

impl<'a, I: ToolInvoker> Pipeline<'a, I> {
    pub fn new(invoker: &'a I, options: &'a PipelineOptions) -> Self {
        Self { invoker, options }
    }

    /// Run `stages` in order. A failure halts the run; skips do not.
    #[instrument(skip_all, fields(stages = stages.len()))]
    pub fn run(&self, stages: &[CiStage], files: FileCounts) -> RunSummary {
        let started = Instant::now();
        let mut results = Vec::with_capacity(stages.len());

        for stage in stages {
            info!(stage = %stage.name(), "starting stage");
            let result = self.run_stage(stage);
            let stop = result.should_stop();
            results.push(result);
            if stop {
                warn!(stage = %stage.name(), "stage failed, stopping pipeline");
                break;
            }
        }

        let success = !results.iter().any(StageResult::is_failure);
        info!(success, duration_ms = millis(started.elapsed()), "pipeline finished");
        RunSummary {
            success,
            results,
            duration: started.elapsed(),
            files,
        }
    }

    /// Run one stage to a verdict.
    pub fn run_stage(&self, stage: &CiStage) -> StageResult {
        let name = stage.name();
        let (files, strategy) = match stage {
            CiStage::TestExecution { files, strategy } => {
                if files.is_empty() {
                    return StageResult::Skipped {
                        stage: name,
                        reason: "no test files found".to_string(),
                    };
                }
                (files.as_slice(), strategy.clone())
            }
            CiStage::TypeCheck { files, .. } if files.is_empty() => {
                return StageResult::Skipped {
                    stage: name,
                    reason: "no source files found".to_string(),
                };
            }
            CiStage::TypeCheck { files, .. }
            | CiStage::LintCheck { files, .. }
            | CiStage::FormatCheck { files, .. }
            | CiStage::LockfileInit { files } => {
                let strategy = ExecutionStrategy::whole(stage.hierarchy().map(Path::to_path_buf));
                (files.as_slice(), strategy)
            }
            CiStage::JsrCheck { .. } => (&[][..], ExecutionStrategy::whole(None)),
        };

        let command = command_for(stage, &self.options.test_args);
        StageExecutor::new(self.invoker, &self.options.invoke).execute(
            name,
            &command,
            &strategy,
            files,
        )
    }

    /// Regenerate the toolchain lock file: delete it, then reload the cache
    /// for `files`.
    #[instrument(skip_all, fields(files = files.len()))]
    pub fn run_lockfile_init(&self, files: &[PathBuf]) -> Result<StageResult> {
        let lock_path = self.options.invoke.cwd.join(&self.options.lock_file);
        if lock_path.exists() {
            fs::remove_file(&lock_path)
                .with_context(|| format!("remove lock file {}", lock_path.display()))?;
            info!(path = %lock_path.display(), "removed lock file");
        }
        Ok(self.run_stage(&CiStage::LockfileInit {
            files: files.to_vec(),
        }))
    }
}
