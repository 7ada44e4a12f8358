//! Detached spawner module.
//!
//! Launches a child from a [`SpawnPlan`] such that its lifetime is
//! independent of the supervisor: new session via `setsid`, `SIGHUP`
//! ignored, stdin closed, stdout/stderr appended to log files, and the
//! supervisor holds no pipes to the child. The returned pid leads a fresh
//! process group, which is what termination signals later target.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::driver::SpawnPlan;

/// Environment tag naming the child's context file.
pub const ENV_CONTEXT_PATH: &str = "DB_YARD_CONTEXT_PATH";
/// Environment tag naming the parent session.
pub const ENV_SESSION_ID: &str = "DB_YARD_SESSION_ID";
/// Environment tag naming the service.
pub const ENV_SERVICE_ID: &str = "DB_YARD_SERVICE_ID";

/// Default bound on the fast-exit liveness confirmation.
pub const DEFAULT_FAST_EXIT: Duration = Duration::from_millis(750);

/// Bound on the graceful termination poll before SIGKILL escalation.
const TERM_GRACE: Duration = Duration::from_secs(2);
const TERM_POLL: Duration = Duration::from_millis(100);

/// Ownership tags stamped into every child's environment.
#[derive(Debug, Clone)]
pub struct SpawnTags {
    /// Parent session id.
    pub session_id: String,

    /// Service id.
    pub service_id: String,

    /// Absolute path of the context file this child is described by.
    pub context_path: PathBuf,
}

impl SpawnTags {
    /// The three well-known environment entries.
    #[must_use]
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(ENV_SESSION_ID.to_string(), self.session_id.clone());
        env.insert(ENV_SERVICE_ID.to_string(), self.service_id.clone());
        env.insert(
            ENV_CONTEXT_PATH.to_string(),
            self.context_path.display().to_string(),
        );
        env
    }
}

/// Everything needed to launch one child.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// The plan to execute.
    pub plan: SpawnPlan,

    /// File stdout appends to.
    pub stdout_path: PathBuf,

    /// File stderr appends to.
    pub stderr_path: PathBuf,

    /// Ownership tags.
    pub tags: SpawnTags,
}

/// What termination accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The pid was already gone.
    AlreadyGone,
    /// The process exited after SIGTERM.
    Terminated,
    /// SIGKILL was required.
    Killed,
}

/// Spawner errors.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The binary could not be launched.
    #[error("failed to spawn '{command}': {source}")]
    Launch {
        /// Binary that failed.
        command: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A log file could not be opened.
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        /// The log path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The child exited within the fast-exit window.
    #[error("child '{command}' exited within {window:?} (status {status:?})")]
    FastExit {
        /// Binary that exited.
        command: String,
        /// The confirmation window.
        window: Duration,
        /// Exit status if collected.
        status: Option<i32>,
    },

    /// The OS did not report a pid.
    #[error("spawned child has no pid")]
    NoPid,

    /// Signal delivery failed for a reason other than the pid being gone.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// Target pid.
        pid: u32,
        /// Errno from the kill call.
        source: nix::Error,
    },
}

/// Launch the plan detached and confirm it survives the fast-exit window.
///
/// # Errors
///
/// Returns [`SpawnError::Launch`] when the binary cannot start,
/// [`SpawnError::LogFile`] when a log file cannot be opened, and
/// [`SpawnError::FastExit`] when the child dies inside `fast_exit`.
pub async fn spawn_detached(
    req: &SpawnRequest,
    fast_exit: Duration,
) -> Result<u32, SpawnError> {
    let stdout = open_log(&req.stdout_path)?;
    let stderr = open_log(&req.stderr_path)?;

    let mut cmd = Command::new(&req.plan.command);
    cmd.args(&req.plan.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(false);

    if let Some(cwd) = &req.plan.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &req.plan.env {
        cmd.env(key, value);
    }
    for (key, value) in req.tags.env() {
        cmd.env(key, value);
    }

    detach(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
        command: req.plan.command.clone(),
        source,
    })?;
    let pid = child.id().ok_or(SpawnError::NoPid)?;

    // Fast-exit guard: a child that dies inside the window is a failed
    // spawn, not a running service.
    tokio::time::sleep(fast_exit).await;
    match child.try_wait() {
        Ok(Some(status)) => {
            return Err(SpawnError::FastExit {
                command: req.plan.command.clone(),
                window: fast_exit,
                status: status.code(),
            });
        }
        Ok(None) => {}
        Err(err) => {
            warn!(pid, error = %err, "fast-exit wait failed; assuming alive");
        }
    }

    debug!(pid, command = %req.plan.command, "spawned detached child");
    // Dropping the handle releases the child; kill_on_drop(false) keeps it
    // running and the runtime reaps it if it ever exits under us.
    drop(child);
    Ok(pid)
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    // New session detaches from the controlling terminal and makes the
    // child the leader of a fresh process group; ignoring SIGHUP covers
    // the window before the session switch completes.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            let ignore = nix::sys::signal::SigAction::new(
                nix::sys::signal::SigHandler::SigIgn,
                nix::sys::signal::SaFlags::empty(),
                nix::sys::signal::SigSet::empty(),
            );
            unsafe { nix::sys::signal::sigaction(Signal::SIGHUP, &ignore) }
                .map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {
    // Without POSIX session primitives detachment is best-effort: stdio is
    // already redirected and no pipes are held, but the child may share
    // the supervisor's fate.
}

fn open_log(path: &Path) -> Result<std::fs::File, SpawnError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SpawnError::LogFile {
            path: path.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SpawnError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Liveness check for an arbitrary pid. Zombies count as dead.
#[must_use]
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if nix::sys::signal::kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }
    // kill(0) succeeds for zombies; /proc settles it on Linux.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat_is_zombie(&stat),
        Err(_) => true,
    }
}

fn stat_is_zombie(stat: &str) -> bool {
    // State is the first field after the parenthesized comm.
    stat.rsplit_once(')')
        .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z'))
}

/// Best-effort command line of a pid.
#[must_use]
pub fn process_cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    let joined = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    Some(joined)
}

/// Terminate a pid and its process group.
///
/// SIGTERM goes to the group first, then the pid; liveness is polled for a
/// bounded interval before escalating to SIGKILL on the group and the pid.
/// Idempotent: an already-gone pid is a success.
///
/// # Errors
///
/// Returns [`SpawnError::Signal`] only for delivery failures other than
/// the pid being gone (for example, insufficient permission).
pub async fn kill_pid(pid: u32) -> Result<KillOutcome, SpawnError> {
    if !is_pid_alive(pid) {
        return Ok(KillOutcome::AlreadyGone);
    }

    signal_group_then_pid(pid, Signal::SIGTERM)?;

    let deadline = tokio::time::Instant::now() + TERM_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !is_pid_alive(pid) {
            return Ok(KillOutcome::Terminated);
        }
        tokio::time::sleep(TERM_POLL).await;
    }

    signal_group_then_pid(pid, Signal::SIGKILL)?;

    let deadline = tokio::time::Instant::now() + TERM_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !is_pid_alive(pid) {
            return Ok(KillOutcome::Killed);
        }
        tokio::time::sleep(TERM_POLL).await;
    }

    warn!(pid, "pid still alive after SIGKILL escalation");
    Ok(KillOutcome::Killed)
}

fn signal_group_then_pid(pid: u32, signal: Signal) -> Result<(), SpawnError> {
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(());
    };
    let target = Pid::from_raw(raw);

    // The child is a session leader, so its pgid equals its pid.
    match killpg(target, signal) {
        Ok(()) | Err(nix::Error::ESRCH) => {}
        Err(source) => {
            debug!(pid, %signal, error = %source, "group signal failed, trying pid");
        }
    }
    match nix::sys::signal::kill(target, signal) {
        Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
        Err(source) => Err(SpawnError::Signal { pid, source }),
    }
}
