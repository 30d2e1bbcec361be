//! Process manager (spec.md §4.5): spawns external commands, exposes their
//! pid and raw stdio streams, and reaps them exactly once — gracefully on
//! cancellation/timeout, escalating to a forced kill after a grace period.
//!
//! Grounded on the pack's ACP backend (`Alb-O-xeno/crates/acp/src/backend.rs`),
//! which spawns a coding-agent CLI via `tokio::process::Command` with piped
//! stdio and leaves line-framing to the caller. The graceful-then-forced
//! termination sequence is grounded on `tumf-agent-exec`'s timeout watcher
//! (SIGTERM, then SIGKILL after a kill-after delay).

use crate::error::{ProcessError, ProcessResult};
use roboppi_common::cancellation::CancelHandle;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Everything needed to spawn and supervise one external command.
pub struct SpawnOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Fired to request a graceful-then-forced shutdown of the process.
    pub cancel: CancelHandle,
    /// Independent of `cancel`: if set, the process is terminated the same
    /// way once this much wall time has elapsed.
    pub timeout: Option<Duration>,
    pub grace_period: Duration,
    /// Run the child in its own process group so termination reaches every
    /// descendant instead of leaving ghost processes behind.
    pub process_group: bool,
}

impl SpawnOptions {
    pub fn new(command: impl Into<String>, cwd: PathBuf, cancel: CancelHandle) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd,
            env: HashMap::new(),
            cancel,
            timeout: None,
            grace_period: Duration::from_secs(10),
            process_group: true,
        }
    }
}

/// Handle to a running process: its pid and raw (unframed) stdio. Callers
/// that want line-oriented output wrap these in their own
/// `BufReader::lines()`, the way `AcpBackend::start_agent` does.
pub struct SpawnedProcess {
    pub pid: u32,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Terminal outcome of a spawned process (spec.md §4.5: "resolves with the
/// actual exit code exactly once").
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    /// Signal number the process was killed by, if any (unix only).
    pub signal: Option<i32>,
    /// Whether the grace period elapsed and a forced kill was required.
    pub forced: bool,
}

/// Resolves exactly once with the process's [`ExitOutcome`].
pub struct ExitFuture {
    rx: oneshot::Receiver<ExitOutcome>,
}

impl Future for ExitFuture {
    type Output = ExitOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(ExitOutcome::default()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Spawns and supervises external commands. Stateless beyond an active-count
/// gauge kept for observability, the way the permit gate tracks its active
/// set.
#[derive(Clone)]
pub struct ProcessManager {
    active: Arc<AtomicUsize>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawns `opts.command`. Returns the handle immediately; the exit
    /// future resolves once the process has actually been reaped, whether
    /// by natural exit, graceful termination, or forced kill.
    pub fn spawn(&self, opts: SpawnOptions) -> ProcessResult<(SpawnedProcess, ExitFuture)> {
        let mut cmd = Command::new(&opts.command);
        cmd.args(&opts.args)
            .current_dir(&opts.cwd)
            .envs(&opts.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        if opts.process_group {
            // SAFETY: `setsid` is async-signal-safe and the closure touches
            // no state outside the child's own address space post-fork.
            unsafe {
                use std::os::unix::process::CommandExt;
                cmd.pre_exec(|| {
                    nix::unistd::setsid()
                        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: opts.command.clone(),
            source,
        })?;
        let pid = child.id().ok_or(ProcessError::AlreadyExited)?;
        let stdout = child.stdout.take().expect("stdout piped at spawn");
        let stderr = child.stderr.take().expect("stderr piped at spawn");

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        let (tx, rx) = oneshot::channel();
        let cancel = opts.cancel;
        let timeout = opts.timeout;
        let grace_period = opts.grace_period;
        let process_group = opts.process_group;

        tokio::spawn(async move {
            let outcome = supervise(child, pid, cancel, timeout, grace_period, process_group).await;
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(outcome);
        });

        Ok((SpawnedProcess { pid, stdout, stderr }, ExitFuture { rx }))
    }
}

async fn supervise(
    mut child: Child,
    pid: u32,
    cancel: CancelHandle,
    timeout: Option<Duration>,
    grace_period: Duration,
    process_group: bool,
) -> ExitOutcome {
    let trigger = async {
        match timeout {
            Some(deadline) => {
                tokio::select! {
                    _ = cancel.clone().aborted_owned() => {}
                    _ = tokio::time::sleep(deadline) => {}
                }
            }
            None => cancel.clone().aborted_owned().await,
        }
    };

    tokio::select! {
        status = child.wait() => return exit_outcome(status, false),
        _ = trigger => {}
    }

    debug!(pid, "sending graceful termination signal");
    terminate(&mut child, pid, process_group);

    tokio::select! {
        status = child.wait() => exit_outcome(status, false),
        _ = tokio::time::sleep(grace_period) => {
            warn!(pid, "grace period elapsed without exit, forcing kill");
            force_kill(&mut child, pid, process_group);
            let status = child.wait().await;
            exit_outcome(status, true)
        }
    }
}

fn exit_outcome(status: std::io::Result<std::process::ExitStatus>, forced: bool) -> ExitOutcome {
    match status {
        Ok(status) => {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal: Option<i32> = None;
            ExitOutcome {
                code: status.code(),
                signal,
                forced,
            }
        }
        Err(_) => ExitOutcome {
            code: None,
            signal: None,
            forced,
        },
    }
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: u32, process_group: bool) {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM, process_group);
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: u32, _process_group: bool) {
    // No portable graceful-termination signal outside unix; escalate
    // straight to a forced stop.
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(_child: &mut Child, pid: u32, process_group: bool) {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL, process_group);
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child, _pid: u32, _process_group: bool) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal, process_group: bool) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = pid as i32;
    // A negative pid signals the whole process group (spec.md §4.5: "all
    // descendants receive the termination signal").
    let target = if process_group { -raw } else { raw };
    if let Err(err) = kill(Pid::from_raw(target), signal) {
        warn!(pid, %signal, %err, "failed to signal process");
    }
}
