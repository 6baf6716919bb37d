//! Helpers for running child processes with timeouts and bounded output.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::millis;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        lossy_with_notice(&self.stdout, self.stdout_truncated, "stdout")
    }

    pub fn stderr_lossy(&self) -> String {
        lossy_with_notice(&self.stderr, self.stderr_truncated, "stderr")
    }
}

fn lossy_with_notice(bytes: &[u8], truncated: usize, stream: &str) -> String {
    let text = String::from_utf8_lossy(bytes);
    if truncated == 0 {
        return text.into_owned();
    }
    format!("{text}\n[{stream} truncated {truncated} bytes]\n")
}

/// Failure to start or await a child process.
#[derive(Debug)]
pub enum SpawnFailure {
    /// The process never started (missing binary, permission denied, ...).
    Spawn(io::Error),
    /// The process started but could not be awaited or read.
    Wait(anyhow::Error),
}

/// How long to wait for output readers once the process group is gone.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Run a command with an optional timeout and capture stdout/stderr without
/// risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On unix the child leads its own process group. When the timeout elapses the whole group is
/// killed and `timed_out` is set.
#[instrument(skip_all, fields(timeout_ms = timeout.map(millis), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
) -> std::result::Result<CommandOutput, SpawnFailure> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(SpawnFailure::Spawn(e));
        }
    };

    let collected = (|| -> Result<CommandOutput> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let stdout_rx = spawn_reader(stdout, output_limit_bytes);
        let stderr_rx = spawn_reader(stderr, output_limit_bytes);

        let waited = match timeout {
            Some(limit) => child.wait_timeout(limit).context("wait for command"),
            None => child.wait().map(Some).context("wait for command"),
        };
        let (status, timed_out) = match waited {
            Ok(Some(status)) => (status, false),
            Ok(None) => {
                warn!(timeout_ms = timeout.map(millis), "command timed out, killing");
                kill_tree(&mut child);
                (child.wait().context("wait command after kill")?, true)
            }
            Err(err) => {
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(err);
            }
        };

        // Background descendants can hold the pipes open after the child exits.
        let deadline = match timeout {
            _ if timed_out => Some(Instant::now() + READER_GRACE),
            Some(limit) => Some((started + limit).max(Instant::now() + READER_GRACE)),
            None => None,
        };
        let pgid = child.id();
        let (stdout, stdout_truncated) =
            receive_output(&stdout_rx, deadline, pgid, "stdout").context("join stdout")?;
        let (stderr, stderr_truncated) =
            receive_output(&stderr_rx, deadline, pgid, "stderr").context("join stderr")?;

        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }

        debug!(exit_code = ?status.code(), timed_out, "command finished");
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out,
            elapsed: started.elapsed(),
        })
    })();

    collected.map_err(SpawnFailure::Wait)
}

type Captured = (Vec<u8>, usize);

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<Result<Captured>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// Wait for a reader until `deadline`. Past it, kill the process group once and
/// give the reader a short grace before discarding the stream.
fn receive_output(
    rx: &Receiver<Result<Captured>>,
    deadline: Option<Instant>,
    pgid: u32,
    stream: &str,
) -> Result<Captured> {
    let Some(deadline) = deadline else {
        return rx
            .recv()
            .unwrap_or_else(|_| Err(anyhow!("{stream} reader thread panicked")));
    };
    let waited = match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Err(RecvTimeoutError::Timeout) => {
            warn!(stream, "output still open after the command exited, killing its process group");
            kill_group(pgid);
            rx.recv_timeout(READER_GRACE)
        }
        other => other,
    };
    match waited {
        Ok(captured) => captured,
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{stream} reader thread panicked")),
        Err(RecvTimeoutError::Timeout) => {
            warn!(stream, "output reader did not finish, discarding");
            Ok((Vec::new(), 0))
        }
    }
}

/// Kill the child and every process left in its group.
fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill command");
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        // ESRCH: the group is already gone.
        debug!(pgid, err = %err, "kill process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Drain `reader` to EOF, keeping at most `limit` bytes.
///
/// Returns the kept bytes and the number of bytes discarded.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut kept = Vec::with_capacity(limit.min(64 * 1024));
    (&mut reader)
        .take(limit as u64)
        .read_to_end(&mut kept)
        .context("read output")?;
    let dropped = io::copy(&mut reader, &mut io::sink()).context("drain output")?;
    Ok((kept, usize::try_from(dropped).unwrap_or(usize::MAX)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let output =
            run_command_with_timeout(sh("echo out; echo err >&2; exit 3"), None, 1024)
                .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(output.stderr_lossy(), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn truncates_beyond_limit() {
        let output =
            run_command_with_timeout(sh("printf 'abcdefghij'"), None, 4).expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_lossy().contains("truncated 6 bytes"));
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_command_with_timeout(
            sh("exec sleep 5"),
            Some(Duration::from_millis(100)),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn timeout_kills_background_descendants() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 4 & sleep 4"),
            Some(Duration::from_millis(200)),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn lingering_descendant_does_not_hold_output_open() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 4 & echo done"),
            Some(Duration::from_millis(500)),
            1024,
        )
        .expect("run");
        assert!(!output.timed_out);
        assert!(output.status.success());
        assert_eq!(output.stdout_lossy(), "done\n");
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn missing_binary_is_spawn_failure() {
        let result = run_command_with_timeout(
            Command::new("ci-runner-definitely-missing-binary"),
            None,
            1024,
        );
        assert!(matches!(result, Err(SpawnFailure::Spawn(_))));
    }
}
