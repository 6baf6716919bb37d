//! `ci-runner`: run the local CI pipeline.
//!
//! Stages run in order and the first failure stops the run. Exit code 0 means
//! every planned stage passed or was skipped; anything else exits 1.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use ci_runner::core::strategy::{
    DEFAULT_BATCH_SIZE, ExecutionMode, ExecutionStrategy, validate_batch_size,
};
use ci_runner::executor::InvokeSettings;
use ci_runner::exit_codes;
use ci_runner::io::config::{CONFIG_FILE_NAME, RunnerConfig, load_config};
use ci_runner::io::discovery::ProjectFiles;
use ci_runner::io::invoker::CommandInvoker;
use ci_runner::logging::{self, LogMode};
use ci_runner::pipeline::{FileCounts, Pipeline, PipelineOptions, RunSummary, plan_stages};
use ci_runner::report;
use clap::{Parser, ValueEnum};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "ci-runner",
    version,
    about = "Run type check, publish check, tests, lint and format check in order"
)]
struct Cli {
    /// Directory (relative to --cwd) every stage is narrowed to.
    #[arg(value_name = "HIERARCHY")]
    hierarchy: Option<PathBuf>,

    /// Same as the positional HIERARCHY.
    #[arg(long = "hierarchy", value_name = "DIR", conflicts_with = "hierarchy")]
    hierarchy_flag: Option<PathBuf>,

    /// How test files are grouped into tool invocations.
    #[arg(long, value_enum, default_value = "all")]
    mode: ModeArg,

    /// Files per invocation in batch mode (1-100).
    #[arg(long)]
    batch_size: Option<usize>,

    /// Do not re-run failing tests at finer granularity.
    #[arg(long)]
    no_fallback: bool,

    #[arg(long, value_enum, default_value_t = LogMode::Normal)]
    log_mode: LogMode,

    /// In single-file mode, stop at the first failing file.
    #[arg(long)]
    stop_on_first_error: bool,

    /// Project root.
    #[arg(long, default_value = ".")]
    cwd: PathBuf,

    /// Config file (default: ci-runner.toml under --cwd, if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-invocation timeout; 0 disables it.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Print the run summary as JSON instead of the text report.
    #[arg(long)]
    json: bool,

    /// Delete the lock file and reload the dependency cache instead of running the pipeline.
    #[arg(long)]
    lockfile_init: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    All,
    Batch,
    SingleFile,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version are not errors.
            let code = if err.use_stderr() {
                exit_codes::FAILED
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    logging::init(cli.log_mode);
    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if cli.log_mode != LogMode::Silent {
                eprintln!("{:#}", err);
            }
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let cfg = load_cli_config(cli)?;
    let options = pipeline_options(cli, &cfg)?;
    let files = ProjectFiles::discover(&cli.cwd, options.hierarchy(), &cfg.discovery)
        .context("discover project files")?;
    info!(
        sources = files.sources.len(),
        tests = files.tests.len(),
        mode = %options.strategy.kind(),
        "starting run"
    );

    let invoker = CommandInvoker {
        output_limit_bytes: cfg.output_limit_bytes,
    };
    let pipeline = Pipeline::new(&invoker, &options);
    let summary = if cli.lockfile_init {
        let started = Instant::now();
        let result = pipeline.run_lockfile_init(&files.all_sources())?;
        RunSummary {
            success: !result.is_failure(),
            results: vec![result],
            duration: started.elapsed(),
            files: FileCounts::from(&files),
        }
    } else {
        let stages = plan_stages(&options, &files);
        pipeline.run(&stages, FileCounts::from(&files))
    };

    write_report(cli, &summary)?;
    Ok(if summary.success {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn load_cli_config(cli: &Cli) -> Result<RunnerConfig> {
    let path = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            path.clone()
        }
        None => cli.cwd.join(CONFIG_FILE_NAME),
    };
    let mut cfg = load_config(&path)?;
    if let Some(secs) = cli.timeout_secs {
        cfg.timeout_secs = secs;
    }
    debug!(tool = %cfg.tool, timeout_secs = cfg.timeout_secs, "effective config");
    Ok(cfg)
}

fn pipeline_options(cli: &Cli, cfg: &RunnerConfig) -> Result<PipelineOptions> {
    if !cli.cwd.is_dir() {
        bail!("working directory {} does not exist", cli.cwd.display());
    }
    let hierarchy = cli.hierarchy.clone().or_else(|| cli.hierarchy_flag.clone());
    if let Some(dir) = &hierarchy {
        if dir.is_absolute() || !cli.cwd.join(dir).is_dir() {
            bail!(
                "hierarchy {} is not a directory under {}",
                dir.display(),
                cli.cwd.display()
            );
        }
    }

    if let Some(size) = cli.batch_size {
        validate_batch_size(size).context("invalid --batch-size")?;
        if cli.mode != ModeArg::Batch {
            warn!(batch_size = size, "--batch-size only applies to --mode batch");
        }
    }
    let mode = match cli.mode {
        ModeArg::All => ExecutionMode::all(),
        ModeArg::Batch => ExecutionMode::batch(cli.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)),
        ModeArg::SingleFile => ExecutionMode::single_file(cli.stop_on_first_error),
    };
    let strategy = ExecutionStrategy::create(mode, !cli.no_fallback, hierarchy)
        .context("invalid execution strategy")?;

    Ok(PipelineOptions {
        strategy,
        test_args: cfg.stages.test_args.clone(),
        jsr_allow_dirty: cfg.stages.jsr_allow_dirty,
        lock_file: PathBuf::from(&cfg.lock_file),
        invoke: InvokeSettings {
            program: cfg.tool.clone(),
            cwd: cli.cwd.clone(),
            timeout: timeout(cfg.timeout_secs),
            env: BTreeMap::from([("NO_COLOR".to_string(), "1".to_string())]),
        },
    })
}

fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn write_report(cli: &Cli, summary: &RunSummary) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if cli.json {
        report::render_json(summary, &mut out)?;
    } else {
        report::render(summary, cli.log_mode, &mut out).context("write report")?;
    }
    out.flush().context("flush stdout")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ci-runner").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn defaults_run_all_mode_with_fallback() {
        let cli = parse(&[]);
        assert_eq!(cli.mode, ModeArg::All);
        assert!(!cli.no_fallback);
        assert_eq!(cli.log_mode, LogMode::Normal);
        assert_eq!(cli.cwd, Path::new("."));
    }

    #[test]
    fn positional_and_flag_hierarchy_conflict() {
        let err = Cli::try_parse_from(["ci-runner", "src/", "--hierarchy", "lib/"])
            .expect_err("conflict");
        assert!(err.use_stderr());
    }

    #[test]
    fn batch_size_zero_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cwd = temp.path().to_str().expect("utf8 path");
        let cli = parse(&["--mode", "batch", "--batch-size", "0", "--cwd", cwd]);
        let err = pipeline_options(&cli, &RunnerConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("batch_size"));
    }

    #[test]
    fn batch_mode_defaults_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cwd = temp.path().to_str().expect("utf8 path");
        let cli = parse(&["--mode", "batch", "--cwd", cwd]);
        let options = pipeline_options(&cli, &RunnerConfig::default()).expect("options");
        assert_eq!(
            options.strategy.mode(),
            &ExecutionMode::batch(DEFAULT_BATCH_SIZE)
        );
    }

    #[test]
    fn zero_timeout_disables_it() {
        assert_eq!(timeout(0), None);
        assert_eq!(timeout(5), Some(Duration::from_secs(5)));
    }
}
