//! Process runner
//!
//! Runs an argv command (never through a shell) with the workspace as its
//! working directory. The child leads its own process group so a timeout can
//! take down everything it started. The leader is left unreaped until the
//! group has been swept, so its pgid cannot be handed to another process in
//! between; it is then reaped with `wait4(2)` to get its rusage.

use crate::result::{ExecutionStats, ExecutionStatus};
use crate::{CmdhostError, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::Pid;
use std::io::{self, ErrorKind, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Signal the kernel uses when it kills a process for running out of memory
pub const OOM_SIGNAL: Signal = Signal::SIGKILL;

/// `PATH` given to children when the daemon environment is not inherited
const MINIMAL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[cfg(target_os = "linux")]
const MAXRSS_UNIT: u64 = 1024;
#[cfg(not(target_os = "linux"))]
const MAXRSS_UNIT: u64 = 1;

/// What the process did, before output files are taken into account
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub signal_num: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stats: ExecutionStats,
}

/// Options for a single run
#[derive(Debug, Clone, Copy)]
pub struct RunOptions<'a> {
    pub cwd: &'a Path,
    pub timeout: Option<Duration>,
    pub inherit_env: bool,
}

/// Run `command` to completion (or until its timeout) and classify the outcome.
///
/// Fails with [`CmdhostError::CommandNotFound`] if the executable cannot be
/// started; every other outcome of the process is data in the [`RawOutcome`].
pub fn run(command: &[String], options: RunOptions<'_>) -> Result<RawOutcome> {
    let Some((program, args)) = command.split_first() else {
        return Err(CmdhostError::InvalidRequest("command is empty".into()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(options.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if !options.inherit_env {
        cmd.env_clear().env("PATH", MINIMAL_PATH);
    }

    let mut stats = ExecutionStats::started_now();
    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            CmdhostError::CommandNotFound(format!("{program}: {e}"))
        }
        _ => CmdhostError::Io(e),
    })?;

    let pid = Pid::from_raw(i32::try_from(child.id()).map_err(|_| {
        CmdhostError::Internal(format!("pid {} out of range", child.id()))
    })?);
    tracing::debug!(pid = pid.as_raw(), program = %program, "child spawned");

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    // A deadline past what `Instant` can represent is no deadline at all.
    let deadline = options
        .timeout
        .and_then(|timeout| start.checked_add(timeout));
    let waited = wait_for_exit(pid, deadline);

    // The leader is a zombie here and still owns the group id. Sweep whatever
    // it left behind so the pipes close, then reap it.
    kill_group(pid);
    let timed_out = waited?;
    let (raw_status, usage) = reap(pid)?;
    let stdout = join_output(stdout);
    let stderr = join_output(stderr);

    stats.duration = start.elapsed();
    stats.finished_at = Utc::now();
    stats.peak_memory_bytes = peak_rss_bytes(&usage);
    stats.user_cpu_time = user_cpu_time(&usage);

    let wait_status = WaitStatus::from_raw(pid, raw_status)?;
    let (status, exit_code, signal_num) = classify(wait_status, timed_out);

    tracing::debug!(
        pid = pid.as_raw(),
        %status,
        exit_code,
        signal_num,
        duration = ?stats.duration,
        "child finished"
    );

    Ok(RawOutcome {
        status,
        exit_code,
        signal_num,
        stdout,
        stderr,
        stats,
    })
}

/// Map a terminal wait status to (status, exit code, signal).
///
/// Timeout takes precedence; the OOM-convention signal refines `Signaled`.
#[must_use]
pub fn classify(
    wait_status: WaitStatus,
    timed_out: bool,
) -> (ExecutionStatus, Option<i32>, Option<i32>) {
    let signal_num = match wait_status {
        WaitStatus::Signaled(_, sig, _) => Some(sig as i32),
        _ => None,
    };

    if timed_out {
        return (ExecutionStatus::Timeout, None, signal_num);
    }

    match wait_status {
        WaitStatus::Signaled(_, sig, _) if sig == OOM_SIGNAL => {
            (ExecutionStatus::Oom, None, signal_num)
        }
        WaitStatus::Signaled(..) => (ExecutionStatus::Signaled, None, signal_num),
        WaitStatus::Exited(_, 0) => (ExecutionStatus::Completed, Some(0), None),
        WaitStatus::Exited(_, code) => (ExecutionStatus::Failed, Some(code), None),
        other => {
            tracing::warn!(?other, "unexpected wait status");
            (ExecutionStatus::Failed, None, None)
        }
    }
}

/// Block until `pid` exits, killing its process group once `deadline` passes.
///
/// Returns whether the deadline fired. The child is not reaped.
fn wait_for_exit(pid: Pid, deadline: Option<Instant>) -> Result<bool> {
    let Some(deadline) = deadline else {
        wait_exited(pid, WaitPidFlag::empty())?;
        return Ok(false);
    };

    let mut interval = MIN_POLL_INTERVAL;
    loop {
        if wait_exited(pid, WaitPidFlag::WNOHANG)? {
            return Ok(false);
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::info!(pid = pid.as_raw(), "timeout reached, killing process group");
            kill_group(pid);
            wait_exited(pid, WaitPidFlag::empty())?;
            return Ok(true);
        }

        thread::sleep(interval.min(deadline - now));
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}

/// `waitid(2)` with `WNOWAIT`: whether `pid` has exited, leaving it a zombie
fn wait_exited(pid: Pid, flags: WaitPidFlag) -> Result<bool> {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | flags) {
            Ok(WaitStatus::StillAlive) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reap an exited child with `wait4(2)`, returning its raw status and rusage
fn reap(pid: Pid) -> Result<(libc::c_int, libc::rusage)> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data; all-zero is a valid value
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        // SAFETY: both out-pointers reference live locals
        let ret = unsafe { libc::wait4(pid.as_raw(), &raw mut status, 0, &raw mut usage) };
        if ret == pid.as_raw() {
            return Ok((status, usage));
        }

        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(CmdhostError::Io(err));
        }
    }
}

fn kill_group(pid: Pid) {
    match signal::killpg(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid = pid.as_raw(), error = %e, "failed to kill process group"),
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        // read_to_end keeps what it read before an error
        if let Err(e) = pipe.read_to_end(&mut buf) {
            tracing::warn!(error = %e, "failed to read child output");
        }
        buf
    }))
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .map(|h| {
            h.join().unwrap_or_else(|_| {
                tracing::error!("output reader thread panicked");
                Vec::new()
            })
        })
        .unwrap_or_default()
}

fn peak_rss_bytes(usage: &libc::rusage) -> u64 {
    u64::try_from(usage.ru_maxrss).unwrap_or(0) * MAXRSS_UNIT
}

fn user_cpu_time(usage: &libc::rusage) -> Duration {
    let secs = u64::try_from(usage.ru_utime.tv_sec).unwrap_or(0);
    let micros = u64::try_from(usage.ru_utime.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}
