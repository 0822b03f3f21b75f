//! Helpers for running child processes with cancellation and bounded output.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long readers may keep draining after the child was killed.
const READER_GRACE: Duration = Duration::from_millis(500);

type StreamResult = std::io::Result<(Vec<u8>, usize)>;

/// Shared flag that asks running children to be killed.
///
/// Cloned into the Ctrl-C handler; every blocking wait polls it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Caller-level timeout. `None` waits for the child however long it takes.
    pub timeout: Option<Duration>,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and dropped.
    pub output_limit_bytes: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout: None,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    /// Captured stderr as text, with a truncation notice appended when needed.
    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }

    pub fn interrupted(&self) -> bool {
        self.timed_out || self.cancelled
    }
}

/// Run a command to completion, capturing stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. The child is killed when
/// `cancel` fires or `limits.timeout` elapses; the returned output records which.
/// When `echo_stdout` is set, child stdout is also copied to our stdout as it arrives.
///
/// On unix the child leads its own process group, so a kill reaches everything
/// it forked. Readers still blocked on an inherited pipe after the kill are
/// abandoned once [`READER_GRACE`] runs out.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = limits.timeout.map(|t| t.as_secs())))]
pub fn run_command(
    mut cmd: Command,
    limits: &RunLimits,
    cancel: &CancelToken,
    echo_stdout: bool,
) -> Result<CommandOutput> {
    let program = PathBuf::from(cmd.get_program());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(Error::LaunchFailed {
                binary: program,
                source: e,
            });
        }
    };

    let pipe_missing = |name: &str| {
        Error::io(
            format!("capture {name} of {}", program.display()),
            std::io::Error::other("pipe was not created"),
        )
    };
    let stdout = child.stdout.take().ok_or_else(|| pipe_missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| pipe_missing("stderr"))?;

    let limit = limits.output_limit_bytes;
    let stdout_rx = spawn_reader(stdout, limit, echo_stdout);
    let stderr_rx = spawn_reader(stderr, limit, false);

    let deadline = limits.timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child
            .wait_timeout(POLL_INTERVAL)
            .map_err(|e| Error::io(format!("wait for {}", program.display()), e))?
        {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("cancellation requested, killing child");
            cancelled = true;
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!("command timed out, killing child");
            timed_out = true;
        } else {
            continue;
        }
        // The child may exit between the poll and the kill; wait() still reaps it.
        kill_process_tree(&mut child);
        break child
            .wait()
            .map_err(|e| Error::io(format!("wait for {} after kill", program.display()), e))?;
    };

    let grace = (timed_out || cancelled).then(|| Instant::now() + READER_GRACE);
    let (stdout, stdout_truncated) = collect_output(&stdout_rx, grace, "stdout", &program)?;
    let (stderr, stderr_truncated) = collect_output(&stderr_rx, grace, "stderr", &program)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// SIGKILL the child's whole process group, falling back to the child alone.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match i32::try_from(child.id()) {
            Ok(pgid) => match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => return,
                Err(e) => debug!(err = %e, "killpg failed, killing child only"),
            },
            Err(_) => debug!(pid = child.id(), "pid out of range for killpg"),
        }
    }
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill failed");
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    echo: bool,
) -> Receiver<StreamResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone only when the run already gave up on this stream.
        let _ = tx.send(read_stream_limited(reader, limit, echo));
    });
    rx
}

/// Wait for a reader's result; with a `grace` deadline, give up on it when it passes.
fn collect_output(
    rx: &Receiver<StreamResult>,
    grace: Option<Instant>,
    stream: &str,
    program: &std::path::Path,
) -> Result<(Vec<u8>, usize)> {
    let context = || format!("read {stream} of {}", program.display());
    let received = match grace {
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
    };
    match received {
        Ok(result) => result.map_err(|e| Error::io(context(), e)),
        Err(RecvTimeoutError::Timeout) => {
            warn!(stream, "pipe still held open after kill, dropping its output");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(Error::io(
            context(),
            std::io::Error::other("output reader thread panicked"),
        )),
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    echo: bool,
) -> std::io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        if echo {
            let mut out = std::io::stdout().lock();
            if let Err(e) = out.write_all(&chunk[..n]).and_then(|()| out.flush()) {
                warn!(err = %e, "failed to echo child stdout");
            }
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
