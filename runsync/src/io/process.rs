//! Owns or observes the user process and maps its termination to an exit code.

use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{Signal, kill};
#[cfg(unix)]
use nix::unistd::Pid;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::exit_codes;

/// How the user process's stdout and stderr are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCapture {
    /// Pipe both streams back to the sync process for teeing.
    #[default]
    Pipe,
    /// Let the process write straight to the terminal; nothing is captured.
    Inherit,
}

pub struct SpawnedProcess {
    pub process: ManagedProcess,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

#[derive(Debug)]
pub enum ManagedProcess {
    /// A child spawned by this process.
    Owned(Child),
    /// A process started elsewhere; its exit code cannot be observed.
    Attached { pid: u32 },
}

/// Exit code for a finished child; a signal death counts as killed.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(exit_codes::KILLED)
}

impl ManagedProcess {
    #[instrument(skip_all, fields(program = ?cmd.get_program(), ?capture))]
    pub fn spawn(mut cmd: Command, capture: OutputCapture) -> Result<SpawnedProcess> {
        cmd.stdin(Stdio::inherit());
        match capture {
            OutputCapture::Pipe => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputCapture::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(err = %e, "failed to spawn user process");
                return Err(e).context("spawn user process");
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        debug!(pid = child.id(), "user process started");
        Ok(SpawnedProcess {
            process: ManagedProcess::Owned(child),
            stdout,
            stderr,
        })
    }

    /// Observe an already running process.
    pub fn attach(pid: u32) -> Result<Self> {
        if !process_alive(pid) {
            return Err(anyhow!("process {pid} is not running"));
        }
        debug!(pid, "attached to user process");
        Ok(ManagedProcess::Attached { pid })
    }

    pub fn pid(&self) -> u32 {
        match self {
            ManagedProcess::Owned(child) => child.id(),
            ManagedProcess::Attached { pid } => *pid,
        }
    }

    /// Wait up to `timeout` for the process to end. `None` means still running.
    ///
    /// An attached process that disappears reports exit code 0.
    pub fn wait_for(&mut self, timeout: Duration) -> Result<Option<i32>> {
        match self {
            ManagedProcess::Owned(child) => {
                let status = if timeout.is_zero() {
                    child.try_wait().context("poll user process")?
                } else {
                    child
                        .wait_timeout(timeout)
                        .context("wait for user process")?
                };
                Ok(status.map(exit_code_of))
            }
            ManagedProcess::Attached { pid } => {
                let deadline = Instant::now() + timeout;
                loop {
                    if !process_alive(*pid) {
                        return Ok(Some(exit_codes::OK));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep((deadline - now).min(Duration::from_millis(100)));
                }
            }
        }
    }

    /// Ask the process to exit (SIGTERM on unix).
    pub fn request_stop(&mut self) -> Result<()> {
        let pid = self.pid();
        #[cfg(unix)]
        {
            send_signal(pid, Some(Signal::SIGTERM))
                .with_context(|| format!("signal process {pid}"))
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    pub fn kill(&mut self) -> Result<()> {
        match self {
            ManagedProcess::Owned(child) => child.kill().context("kill user process"),
            ManagedProcess::Attached { pid } => {
                #[cfg(unix)]
                {
                    send_signal(*pid, Some(Signal::SIGKILL))
                        .with_context(|| format!("kill process {pid}"))
                }
                #[cfg(not(unix))]
                {
                    Err(anyhow!("cannot kill attached process {pid} on this platform"))
                }
            }
        }
    }

    /// Request a stop, wait `grace`, then kill. Returns the exit code if the process ended.
    #[instrument(skip_all, fields(pid = self.pid(), grace_secs = grace.as_secs()))]
    pub fn terminate(&mut self, grace: Duration) -> Result<Option<i32>> {
        if let Some(code) = self.wait_for(Duration::ZERO)? {
            return Ok(Some(code));
        }
        info!("stopping user process");
        if let Err(err) = self.request_stop() {
            warn!(err = %err, "stop request failed");
        }
        if let Some(code) = self.wait_for(grace)? {
            return Ok(Some(code));
        }
        warn!("user process ignored stop request; killing");
        self.kill()?;
        self.wait_for(grace)
    }
}

/// `None` only checks that the pid exists and may be signalled.
#[cfg(unix)]
fn send_signal(pid: u32, signal: Option<Signal>) -> Result<(), Errno> {
    let pid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    kill(Pid::from_raw(pid), signal)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    match send_signal(pid, None) {
        Ok(()) => true,
        Err(err) => err == Errno::EPERM,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
