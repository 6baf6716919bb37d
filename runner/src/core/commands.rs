//! Argument lists for each stage's toolchain subcommand.

use std::path::{Path, PathBuf};

use crate::core::types::CiStage;

/// Subcommand prefix plus the scope it applies to.
///
/// Path arguments are appended per invocation, so one command serves every
/// partition of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub prefix: Vec<String>,
    pub hierarchy: Option<PathBuf>,
}

impl ToolCommand {
    pub fn args_for(&self, files: &[PathBuf]) -> Vec<String> {
        let mut args = self.prefix.clone();
        args.extend(path_args(files, self.hierarchy.as_deref()));
        args
    }
}

/// Path arguments for one invocation.
///
/// Explicit files are passed verbatim and win over the hierarchy; otherwise
/// the hierarchy path alone; otherwise nothing (whole project).
pub fn path_args(files: &[PathBuf], hierarchy: Option<&Path>) -> Vec<String> {
    if !files.is_empty() {
        return files
            .iter()
            .map(|file| file.to_string_lossy().into_owned())
            .collect();
    }
    match hierarchy {
        Some(path) => vec![path.to_string_lossy().into_owned()],
        None => Vec::new(),
    }
}

/// Build the toolchain command for `stage`.
///
/// `test_args` are flags inserted between `test` and the file arguments.
pub fn command_for(stage: &CiStage, test_args: &[String]) -> ToolCommand {
    match stage {
        CiStage::TypeCheck { hierarchy, .. } => ToolCommand {
            prefix: strings(&["check"]),
            hierarchy: hierarchy.clone(),
        },
        CiStage::JsrCheck { allow_dirty } => {
            let mut prefix = strings(&["publish", "--dry-run"]);
            if *allow_dirty {
                prefix.push("--allow-dirty".to_string());
            }
            ToolCommand {
                prefix,
                hierarchy: None,
            }
        }
        CiStage::TestExecution { strategy, .. } => {
            let mut prefix = strings(&["test"]);
            prefix.extend(test_args.iter().cloned());
            ToolCommand {
                prefix,
                hierarchy: strategy.hierarchy().map(Path::to_path_buf),
            }
        }
        CiStage::LintCheck { hierarchy, .. } => ToolCommand {
            prefix: strings(&["lint"]),
            hierarchy: hierarchy.clone(),
        },
        CiStage::FormatCheck { hierarchy, .. } => ToolCommand {
            prefix: strings(&["fmt", "--check"]),
            hierarchy: hierarchy.clone(),
        },
        CiStage::LockfileInit { .. } => ToolCommand {
            prefix: strings(&["cache", "--reload"]),
            hierarchy: None,
        },
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_string()).collect()
}
