//! Test-only helpers: a scripted tool invoker and throwaway project trees.

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::types::ProcessResult;
use crate::io::invoker::{Invocation, InvocationError, ToolInvoker};

type Matcher = Box<dyn Fn(&Invocation) -> bool>;

enum Response {
    Fail(String),
    Error(InvocationError),
}

/// Invoker that succeeds unless a rule matches, recording every call.
///
/// Rules are checked in insertion order; the first match decides the
/// response. Failing responses put their text on stderr with exit code 1.
#[derive(Default)]
pub struct FakeInvoker {
    rules: Vec<(Matcher, Response)>,
    calls: RefCell<Vec<Invocation>>,
}

impl FakeInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any invocation whose arguments include `arg`.
    pub fn fail_on_arg(self, arg: &str, output: &str) -> Self {
        let arg = arg.to_string();
        self.fail_when(move |inv| inv.args.iter().any(|a| *a == arg), output)
    }

    /// Fail any invocation of the toolchain subcommand `subcommand`.
    pub fn fail_on_subcommand(self, subcommand: &str, output: &str) -> Self {
        let subcommand = subcommand.to_string();
        self.fail_when(
            move |inv| inv.args.first().is_some_and(|a| *a == subcommand),
            output,
        )
    }

    pub fn fail_when<F>(mut self, matcher: F, output: &str) -> Self
    where
        F: Fn(&Invocation) -> bool + 'static,
    {
        self.rules
            .push((Box::new(matcher), Response::Fail(output.to_string())));
        self
    }

    /// Return an invocation-level error for any invocation including `arg`.
    pub fn error_on_arg(mut self, arg: &str, error: InvocationError) -> Self {
        let arg = arg.to_string();
        self.rules.push((
            Box::new(move |inv: &Invocation| inv.args.iter().any(|a| *a == arg)),
            Response::Error(error),
        ));
        self
    }

    /// Every invocation seen so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    /// First argument of every invocation (the toolchain subcommand).
    pub fn subcommands(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|inv| inv.args.first().cloned())
            .collect()
    }
}

impl ToolInvoker for FakeInvoker {
    fn invoke(&self, invocation: &Invocation) -> Result<ProcessResult, InvocationError> {
        self.calls.borrow_mut().push(invocation.clone());
        let response = self
            .rules
            .iter()
            .find(|(matcher, _)| matcher(invocation))
            .map(|(_, response)| response);
        match response {
            None => Ok(ProcessResult {
                success: true,
                exit_code: Some(0),
                stdout: "ok\n".to_string(),
                stderr: String::new(),
                duration: Duration::from_millis(1),
            }),
            Some(Response::Fail(output)) => Ok(ProcessResult {
                success: false,
                exit_code: Some(1),
                stdout: String::new(),
                stderr: output.clone(),
                duration: Duration::from_millis(1),
            }),
            Some(Response::Error(err)) => Err(err.clone()),
        }
    }
}

/// Temporary project directory removed on drop.
pub struct TempProject {
    dir: tempfile::TempDir,
}

impl TempProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp project")?;
        Ok(Self { dir })
    }

    /// Create a project holding empty files at the given relative paths.
    pub fn with_files(paths: &[&str]) -> Result<Self> {
        let project = Self::new()?;
        for rel in paths {
            project.write(rel, "")?;
        }
        Ok(project)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }
}
