//! Stage execution: partitioned tool invocations with diagnostic fallback.
//!
//! A stage runs its files under an [`ExecutionStrategy`]. Partitions run
//! strictly in order; the first failing partition stops the run (except in
//! `single-file` mode without `stop_on_first_error`, which keeps going and
//! fails at the end). When the Fallback Policy allows it, the failure is
//! replayed at the next finer granularity, restricted to the failing scope,
//! to pinpoint the offending files. Fallback never changes the verdict.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::core::classifier::classify;
use crate::core::commands::ToolCommand;
use crate::core::fallback::{create_fallback_strategy, fallback_scope, should_fallback};
use crate::core::strategy::{ExecutionMode, ExecutionStrategy, ModeKind, Partition, partition};
use crate::core::types::{
    CiError, FallbackOutcome, FallbackStep, ProcessResult, StageName, StageResult,
};
use crate::io::invoker::{Invocation, InvocationError, ToolInvoker};

/// Settings shared by every invocation of a run.
#[derive(Debug, Clone)]
pub struct InvokeSettings {
    pub program: String,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

/// Why a partition failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The tool ran and reported failure; its output can be classified.
    Output(ProcessResult),
    /// The tool could not be run to completion.
    Invocation(InvocationError),
}

/// First failing partition of a strategy run, plus every file that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFailure {
    pub mode: ModeKind,
    pub partition: Partition,
    pub cause: FailureCause,
    /// Every file attributed to a failure. In `single-file` mode without
    /// `stop_on_first_error` this spans all failing files, otherwise it is the
    /// failing partition's files.
    pub failed_files: Vec<PathBuf>,
    /// Files of partitions skipped after the run stopped.
    pub unreached: Vec<PathBuf>,
}

/// Outcome of running every partition of one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Passed { invocations: usize },
    Failed(Box<PartitionFailure>),
}

/// Drives one stage to completion over a [`ToolInvoker`].
pub struct StageExecutor<'a, I: ToolInvoker> {
    invoker: &'a I,
    settings: &'a InvokeSettings,
}

impl<'a, I: ToolInvoker> StageExecutor<'a, I> {
    pub fn new(invoker: &'a I, settings: &'a InvokeSettings) -> Self {
        Self { invoker, settings }
    }

    /// Run `stage` over `files` under `strategy` and report the verdict.
    ///
    /// Files are sorted and de-duplicated first so partitions and "first
    /// failing item" are reproducible.
    #[instrument(skip_all, fields(stage = %stage, mode = %strategy.kind(), files = files.len()))]
    pub fn execute(
        &self,
        stage: StageName,
        command: &ToolCommand,
        strategy: &ExecutionStrategy,
        files: &[PathBuf],
    ) -> StageResult {
        let started = Instant::now();
        let files = sorted_unique(files);

        let failure = match self.run_strategy(command, strategy, &files) {
            RunOutcome::Passed { invocations } => {
                info!(invocations, "stage passed");
                return StageResult::Success {
                    stage,
                    duration: started.elapsed(),
                    files_processed: files.len(),
                };
            }
            RunOutcome::Failed(failure) => failure,
        };

        let error = error_for(&failure);
        warn!(
            kind = %error.kind(),
            partition = failure.partition.index,
            start = failure.partition.start,
            end = failure.partition.end,
            "stage failed"
        );
        let (error, fallback) = self.diagnose(command, strategy, &files, *failure, error);

        StageResult::Failure {
            stage,
            error,
            duration: started.elapsed(),
            fallback,
        }
    }

    /// Replay a failure at finer granularity to narrow its file attribution.
    ///
    /// Returns the original error (possibly with a narrower file list) and the
    /// trail of fallback steps taken.
    fn diagnose(
        &self,
        command: &ToolCommand,
        strategy: &ExecutionStrategy,
        original_files: &[PathBuf],
        failure: PartitionFailure,
        error: CiError,
    ) -> (CiError, Vec<FallbackStep>) {
        let mut trail = Vec::new();
        let mut attributed = initial_attribution(&failure, &error);
        let mut current = strategy.clone();
        let mut current_failure = failure;

        while should_fallback(&current, &error) {
            let next = match create_fallback_strategy(&current) {
                Ok(next) => next,
                Err(err) => {
                    debug!(err = %err, "fallback exhausted");
                    break;
                }
            };
            let scope = fallback_scope(
                current.kind(),
                original_files,
                &current_failure.partition.files,
            );
            if scope.is_empty() {
                debug!("no file list to narrow, skipping fallback");
                break;
            }

            info!(from = %current.kind(), to = %next.kind(), scope = scope.len(), "falling back");
            match self.run_strategy(command, &next, &scope) {
                RunOutcome::Passed { .. } => {
                    info!(mode = %next.kind(), "failure did not reproduce at finer granularity");
                    trail.push(FallbackStep {
                        mode: next.kind(),
                        scope: scope.len(),
                        outcome: FallbackOutcome::NotReproduced,
                    });
                    break;
                }
                RunOutcome::Failed(narrowed) => {
                    info!(mode = %next.kind(), files = ?narrowed.failed_files, "failure reproduced");
                    trail.push(FallbackStep {
                        mode: next.kind(),
                        scope: scope.len(),
                        outcome: FallbackOutcome::Reproduced {
                            files: narrowed.failed_files.clone(),
                        },
                    });
                    // Files named in the output that the replay stopped before stay suspect.
                    let pending = error
                        .files()
                        .iter()
                        .filter(|file| narrowed.unreached.contains(file))
                        .cloned();
                    let merged: Vec<PathBuf> =
                        narrowed.failed_files.iter().cloned().chain(pending).collect();
                    attributed = sorted_unique(&merged);
                    current_failure = *narrowed;
                    current = next;
                }
            }
        }

        (error.with_files(attributed), trail)
    }

    /// Invoke every partition of `files` under `strategy`, in order.
    pub fn run_strategy(
        &self,
        command: &ToolCommand,
        strategy: &ExecutionStrategy,
        files: &[PathBuf],
    ) -> RunOutcome {
        if files.is_empty() {
            // Nothing to partition: one invocation over the hierarchy or whole project.
            let whole = Partition {
                index: 0,
                start: 0,
                end: 0,
                files: Vec::new(),
            };
            return match self.run_partition(command, &whole) {
                Ok(()) => RunOutcome::Passed { invocations: 1 },
                Err(cause) => RunOutcome::Failed(Box::new(PartitionFailure {
                    mode: strategy.kind(),
                    partition: whole,
                    cause,
                    failed_files: Vec::new(),
                    unreached: Vec::new(),
                })),
            };
        }

        let partitions = partition(files, strategy);
        let total = partitions.len();
        let keep_going = matches!(
            strategy.mode(),
            ExecutionMode::SingleFile {
                stop_on_first_error: false,
                ..
            }
        );

        let mut first_failure: Option<PartitionFailure> = None;
        let mut failed_files = Vec::new();
        let mut stopped = false;
        let mut remaining = partitions.into_iter();
        for part in remaining.by_ref() {
            debug!(index = part.index, total, start = part.start, end = part.end, "running partition");
            let Err(cause) = self.run_partition(command, &part) else {
                continue;
            };
            warn!(index = part.index, total, files = ?part.files, "partition failed");
            failed_files.extend(part.files.iter().cloned());
            if first_failure.is_none() {
                first_failure = Some(PartitionFailure {
                    mode: strategy.kind(),
                    partition: part,
                    cause,
                    failed_files: Vec::new(),
                    unreached: Vec::new(),
                });
            }
            if !keep_going {
                stopped = true;
                break;
            }
        }

        match first_failure {
            None => RunOutcome::Passed { invocations: total },
            Some(mut failure) => {
                failure.failed_files = failed_files;
                if stopped {
                    failure.unreached = remaining.flat_map(|part| part.files).collect();
                }
                RunOutcome::Failed(Box::new(failure))
            }
        }
    }

    fn run_partition(&self, command: &ToolCommand, part: &Partition) -> Result<(), FailureCause> {
        let invocation = Invocation {
            program: self.settings.program.clone(),
            args: command.args_for(&part.files),
            cwd: self.settings.cwd.clone(),
            timeout: self.settings.timeout,
            env: self.settings.env.clone(),
        };
        match self.invoker.invoke(&invocation) {
            Ok(result) if result.success => Ok(()),
            Ok(result) => {
                debug!(exit_code = ?result.exit_code, "tool reported failure");
                Err(FailureCause::Output(result))
            }
            Err(err) => {
                warn!(invocation_error = %err, "tool invocation failed");
                Err(FailureCause::Invocation(err))
            }
        }
    }
}

/// Map a partition failure to a classified error.
///
/// Only output-bearing failures are classified; invocation errors become
/// [`CiError::Process`].
fn error_for(failure: &PartitionFailure) -> CiError {
    match &failure.cause {
        FailureCause::Output(result) => classify(result),
        FailureCause::Invocation(err) => CiError::Process {
            command: err.command().to_string(),
            detail: err.to_string(),
        },
    }
}

/// Files attributed to the original failure before any fallback.
///
/// Prefer paths named in the tool output; otherwise use the failing partition
/// when it is narrower than the whole run.
fn initial_attribution(failure: &PartitionFailure, error: &CiError) -> Vec<PathBuf> {
    if !error.files().is_empty() || failure.mode == ModeKind::All {
        return error.files().to_vec();
    }
    failure.failed_files.clone()
}

fn sorted_unique(files: &[PathBuf]) -> Vec<PathBuf> {
    let mut sorted = files.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;
    use crate::test_support::FakeInvoker;

    fn settings() -> InvokeSettings {
        InvokeSettings {
            program: "deno".to_string(),
            cwd: PathBuf::from("."),
            timeout: None,
            env: Default::default(),
        }
    }

    fn test_command() -> ToolCommand {
        ToolCommand {
            prefix: vec!["test".to_string()],
            hierarchy: None,
        }
    }

    fn files(n: usize) -> Vec<PathBuf> {
        (1..=n).map(|i| PathBuf::from(format!("f{i:02}_test.ts"))).collect()
    }

    fn strategy(mode: ExecutionMode, fallback: bool) -> ExecutionStrategy {
        ExecutionStrategy::create(mode, fallback, None).expect("strategy")
    }

    #[test]
    fn batch_happy_path_invokes_ceil_n_over_s() {
        let invoker = FakeInvoker::new();
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::batch(4), true),
            &files(10),
        );
        assert!(result.is_success());
        let calls = invoker.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].args.len(), 1 + 4);
        assert_eq!(calls[2].args.len(), 1 + 2);
    }

    #[test]
    fn unsorted_input_runs_in_sorted_order() {
        let invoker = FakeInvoker::new();
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let input = vec![
            PathBuf::from("b_test.ts"),
            PathBuf::from("a_test.ts"),
            PathBuf::from("b_test.ts"),
        ];
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::single_file(true), false),
            &input,
        );
        assert!(matches!(
            result,
            StageResult::Success {
                files_processed: 2,
                ..
            }
        ));
        let args: Vec<Vec<String>> = invoker.calls().into_iter().map(|c| c.args).collect();
        assert_eq!(args, vec![vec!["test", "a_test.ts"], vec!["test", "b_test.ts"]]);
    }

    #[test]
    fn empty_file_list_runs_once_over_scope() {
        let invoker = FakeInvoker::new();
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let command = ToolCommand {
            prefix: vec!["lint".to_string()],
            hierarchy: Some(PathBuf::from("src/")),
        };
        let result = executor.execute(
            StageName::LintCheck,
            &command,
            &strategy(ExecutionMode::batch(5), false),
            &[],
        );
        assert!(result.is_success());
        assert_eq!(invoker.calls()[0].args, vec!["lint", "src/"]);
    }

    #[test]
    fn batch_failure_stops_and_reports_failed_batch() {
        let invoker = FakeInvoker::new().fail_on_arg("f06_test.ts", "Test failed: f06");
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let outcome = executor.run_strategy(
            &test_command(),
            &strategy(ExecutionMode::batch(4), false),
            &files(12),
        );
        let RunOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.partition.index, 1);
        assert_eq!((failure.partition.start, failure.partition.end), (4, 8));
        assert_eq!(failure.partition.files, files(8)[4..].to_vec());
        // The third batch never ran.
        assert_eq!(invoker.calls().len(), 2);
    }

    #[test]
    fn fallback_narrows_to_failed_batch_only() {
        // The second batch (f05..f08) fails; the single-file replay must stay inside it.
        let invoker = FakeInvoker::new().fail_on_arg("f06_test.ts", "Test failed: assertion");
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::batch(4), true),
            &files(12),
        );

        let StageResult::Failure {
            error, fallback, ..
        } = &result
        else {
            panic!("expected failure, got {result:?}");
        };
        assert_eq!(error.kind(), ErrorKind::TestFailure);
        assert_eq!(error.files(), &[PathBuf::from("f06_test.ts")]);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].mode, ModeKind::SingleFile);
        assert_eq!(fallback[0].scope, 4);

        let single_file_calls: Vec<String> = invoker
            .calls()
            .into_iter()
            .skip(2)
            .map(|c| c.args[1..].join(" "))
            .collect();
        assert_eq!(single_file_calls, vec!["f05_test.ts", "f06_test.ts"]);
    }

    #[test]
    fn named_files_past_the_replay_stop_stay_attributed() {
        // The batch output names f06 and f08; the single-file replay stops at f06.
        let invoker = FakeInvoker::new().fail_on_arg(
            "f06_test.ts",
            "Test failed: f06_test.ts\nTest failed: f08_test.ts",
        );
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::batch(4), true),
            &files(8),
        );

        let StageResult::Failure {
            error, fallback, ..
        } = &result
        else {
            panic!("expected failure, got {result:?}");
        };
        assert_eq!(
            error.files(),
            &[PathBuf::from("f06_test.ts"), PathBuf::from("f08_test.ts")]
        );
        assert_eq!(
            fallback[0].outcome,
            FallbackOutcome::Reproduced {
                files: vec![PathBuf::from("f06_test.ts")]
            }
        );
        // f07 and f08 were never replayed.
        assert_eq!(invoker.calls().len(), 2 + 2);
    }

    #[test]
    fn named_files_the_replay_cleared_are_dropped() {
        // f01 is named in the output but passes alone before the replay stops at f02.
        let invoker = FakeInvoker::new().fail_when(
            |inv| inv.args.len() > 2 || inv.args.iter().any(|a| a == "f02_test.ts"),
            "Test failed: f01_test.ts\nTest failed: f02_test.ts",
        );
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::all(), true),
            &files(3),
        );

        let StageResult::Failure { error, .. } = &result else {
            panic!("expected failure, got {result:?}");
        };
        assert_eq!(error.files(), &[PathBuf::from("f02_test.ts")]);
    }

    #[test]
    fn all_mode_falls_back_through_batch_to_single_file() {
        let invoker = FakeInvoker::new().fail_on_arg("f13_test.ts", "test failed");
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::all(), true),
            &files(15),
        );
        let StageResult::Failure { error, fallback, .. } = &result else {
            panic!("expected failure");
        };
        let modes: Vec<ModeKind> = fallback.iter().map(|step| step.mode).collect();
        assert_eq!(modes, vec![ModeKind::Batch, ModeKind::SingleFile]);
        // all -> batch re-runs every file; batch -> single-file only the failed batch.
        assert_eq!(fallback[0].scope, 15);
        assert_eq!(fallback[1].scope, 5);
        assert_eq!(error.files(), &[PathBuf::from("f13_test.ts")]);
    }

    #[test]
    fn fallback_never_turns_failure_into_success() {
        // Fails only when f01 and f02 run together in one invocation.
        let invoker = FakeInvoker::new().fail_when(
            |inv| {
                inv.args.iter().any(|a| a == "f01_test.ts")
                    && inv.args.iter().any(|a| a == "f02_test.ts")
            },
            "test failed: shared state leaked",
        );
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::batch(2), true),
            &files(2),
        );
        let StageResult::Failure { error, fallback, .. } = &result else {
            panic!("fallback must not upgrade the verdict: {result:?}");
        };
        assert!(result.should_stop());
        assert_eq!(error.kind(), ErrorKind::TestFailure);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].outcome, FallbackOutcome::NotReproduced);
        // Attribution falls back to the failed batch.
        assert_eq!(error.files(), files(2).as_slice());
    }

    #[test]
    fn disabled_fallback_runs_no_extra_invocations() {
        let invoker = FakeInvoker::new().fail_on_arg("f03_test.ts", "test failed");
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::batch(5), false),
            &files(10),
        );
        assert!(result.is_failure());
        assert_eq!(invoker.calls().len(), 1);
        let StageResult::Failure { fallback, .. } = result else {
            unreachable!();
        };
        assert!(fallback.is_empty());
    }

    #[test]
    fn static_failures_do_not_fall_back() {
        let invoker = FakeInvoker::new().fail_on_arg("f02_test.ts", "deno lint: unused variable");
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::LintCheck,
            &ToolCommand {
                prefix: vec!["lint".to_string()],
                hierarchy: None,
            },
            &strategy(ExecutionMode::batch(5), true),
            &files(5),
        );
        assert_eq!(result.error().map(CiError::kind), Some(ErrorKind::LintError));
        assert_eq!(invoker.calls().len(), 1);
    }

    #[test]
    fn single_file_continue_accumulates_and_fails() {
        let invoker = FakeInvoker::new()
            .fail_on_arg("f02_test.ts", "test failed: two")
            .fail_on_arg("f04_test.ts", "test failed: four");
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::single_file(false), true),
            &files(5),
        );
        assert_eq!(invoker.calls().len(), 5);
        let StageResult::Failure { error, fallback, .. } = &result else {
            panic!("any failing file fails the stage");
        };
        assert!(error.detail().contains("two"));
        assert_eq!(
            error.files(),
            &[PathBuf::from("f02_test.ts"), PathBuf::from("f04_test.ts")]
        );
        assert!(fallback.is_empty());
    }

    #[test]
    fn single_file_stop_on_first_error() {
        let invoker = FakeInvoker::new()
            .fail_on_arg("f02_test.ts", "test failed")
            .fail_on_arg("f04_test.ts", "test failed");
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::single_file(true), true),
            &files(5),
        );
        assert_eq!(invoker.calls().len(), 2);
        assert_eq!(
            result.error().map(|e| e.files().to_vec()),
            Some(vec![PathBuf::from("f02_test.ts")])
        );
    }

    #[test]
    fn invocation_errors_are_not_retried() {
        let invoker = FakeInvoker::new().error_on_arg(
            "f01_test.ts",
            InvocationError::Spawn {
                command: "deno test f01_test.ts".to_string(),
                message: "No such file or directory (os error 2)".to_string(),
            },
        );
        let settings = settings();
        let executor = StageExecutor::new(&invoker, &settings);
        let result = executor.execute(
            StageName::TestExecution,
            &test_command(),
            &strategy(ExecutionMode::batch(5), true),
            &files(5),
        );
        let StageResult::Failure { error, fallback, .. } = &result else {
            panic!("expected failure");
        };
        assert_eq!(error.kind(), ErrorKind::ProcessError);
        assert!(error.detail().contains("os error 2"));
        assert!(fallback.is_empty());
        assert_eq!(invoker.calls().len(), 1);
    }
}
