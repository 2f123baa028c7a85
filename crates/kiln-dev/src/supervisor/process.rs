//! A single run of the application process.
//!
//! Each spawned child is owned by a reaper task that waits for it to exit
//! and publishes the outcome on a watch channel. Stopping is a signal plus a
//! bounded wait on that channel, with a forced kill when the grace period
//! runs out. Dropping an [`AppProcess`] without stopping it kills the child.
//!
//! On Unix the child leads its own process group so toolchain wrappers
//! (`go run` and friends) are terminated together with the binary they start.

use crate::error::SupervisorError;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

/// How often a draining process group is checked for survivors.
#[cfg(unix)]
const GROUP_POLL: Duration = Duration::from_millis(20);
/// How long to wait for a group to vanish after SIGKILL.
#[cfg(unix)]
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// Environment variable carrying the port the application must bind.
pub const ENV_PORT: &str = "PORT";
/// Set to `1` when running under the dev server.
pub const ENV_DEV_MODE: &str = "KILN_DEV";
/// Base directory for templates and assets in development mode.
pub const ENV_DEV_ROOT: &str = "KILN_ROOT";

/// How to launch the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable to run
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: PathBuf,
    /// Extra environment on top of the inherited one
    pub env: Vec<(String, String)>,
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a process ended.
#[derive(Debug, Clone)]
pub enum ExitState {
    /// The process exited with a status
    Exited(ExitStatus),
    /// Waiting on the process failed
    Lost(String),
}

impl ExitState {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        matches!(self, ExitState::Exited(status) if status.success())
    }
}

/// A running (or finished) application process.
pub struct AppProcess {
    pid: Option<u32>,
    port: u16,
    exit: watch::Receiver<Option<ExitState>>,
    kill: Option<oneshot::Sender<()>>,
}

impl AppProcess {
    /// Spawn `spec`, telling it to listen on `port`.
    pub fn spawn(spec: &LaunchSpec, port: u16) -> Result<Self, SupervisorError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENV_PORT, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            command: spec.to_string(),
            source,
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, true));
        }

        let (exit_tx, exit) = watch::channel(None);
        let (kill, kill_rx) = oneshot::channel();
        tokio::spawn(reap(child, pid, kill_rx, exit_tx));

        tracing::info!(pid, port, command = %spec, "application started");
        Ok(Self {
            pid,
            port,
            exit,
            kill: Some(kill),
        })
    }

    /// OS process id, if the child was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Port handed to the child.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the reaper has observed the exit.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Exit state, once known.
    pub fn exit_state(&self) -> Option<ExitState> {
        self.exit.borrow().clone()
    }

    /// Terminate the process.
    ///
    /// Sends SIGTERM to the process group, waits up to `grace`, then kills.
    /// On Unix the group is drained too: members that outlive the leader get
    /// the rest of the grace period before SIGKILL. Always returns after the
    /// process is gone.
    pub async fn stop(mut self, grace: Duration) -> Option<ExitState> {
        let deadline = Instant::now() + grace;
        if !self.has_exited() {
            self.terminate();

            let mut exit = self.exit.clone();
            let graceful = tokio::time::timeout_at(deadline, exit.wait_for(|s| s.is_some())).await;
            if graceful.is_err() {
                tracing::warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "application ignored SIGTERM, killing"
                );
                self.force_kill();
            }
        }

        let mut exit = self.exit.clone();
        let _ = exit.wait_for(|s| s.is_some()).await;
        let state = exit.borrow().clone();

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            drain_group(pid, deadline).await;
        }
        state
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        if let Some(pid) = self.pid {
            if let Err(e) = signal_group(pid, libc::SIGTERM) {
                tracing::warn!(pid, error = %e, "failed to send SIGTERM");
                self.force_kill();
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        self.force_kill();
    }

    fn force_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

impl Drop for AppProcess {
    fn drop(&mut self) {
        // The reaper only kills the group while the leader is alive.
        #[cfg(unix)]
        if self.has_exited() {
            if let Some(pid) = self.pid {
                signal_group_only(pid, libc::SIGKILL);
            }
        }
        // Dropping the sender wakes the reaper, which kills the child.
        self.kill.take();
    }
}

impl fmt::Debug for AppProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppProcess")
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("exited", &self.has_exited())
            .finish()
    }
}

async fn reap(
    mut child: Child,
    pid: Option<u32>,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<ExitState>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            #[cfg(unix)]
            if let Some(pid) = pid {
                let _ = signal_group(pid, libc::SIGKILL);
            }
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let state = match status {
        Ok(status) => {
            if status.success() {
                tracing::debug!(pid, "application exited");
            } else {
                tracing::warn!(pid, %status, "application exited with failure");
            }
            ExitState::Exited(status)
        }
        Err(e) => {
            tracing::error!(pid, error = %e, "lost track of application process");
            ExitState::Lost(e.to_string())
        }
    };
    exit.send_replace(Some(state));
}

async fn forward_output<R>(reader: R, pid: Option<u32>, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            tracing::warn!(target: "app", pid, "{}", line);
        } else {
            tracing::info!(target: "app", pid, "{}", line);
        }
    }
}

/// Wait for every member of the group led by `pid` to exit.
///
/// Survivors are sent SIGTERM, then SIGKILL once `deadline` passes.
#[cfg(unix)]
async fn drain_group(pid: u32, deadline: Instant) {
    if !group_alive(pid) {
        return;
    }
    tracing::debug!(pid, "application left processes behind, terminating group");
    signal_group_only(pid, libc::SIGTERM);

    while group_alive(pid) {
        if Instant::now() >= deadline {
            tracing::warn!(pid, "application group ignored SIGTERM, killing");
            signal_group_only(pid, libc::SIGKILL);
            let settle = Instant::now() + KILL_SETTLE;
            while group_alive(pid) && Instant::now() < settle {
                tokio::time::sleep(GROUP_POLL).await;
            }
            return;
        }
        tokio::time::sleep(GROUP_POLL).await;
    }
}

/// Whether any process is left in the group led by `pid`.
#[cfg(unix)]
fn group_alive(pid: u32) -> bool {
    signal_group_only(pid, 0)
}

/// Signal the group led by `pid`, without falling back to the pid itself.
/// Returns whether the signal was delivered.
#[cfg(unix)]
fn signal_group_only(pid: u32, signal: i32) -> bool {
    match i32::try_from(pid) {
        // SAFETY: `libc::kill` takes plain integers and touches no memory we own.
        Ok(pid) if pid > 0 => unsafe { libc::kill(-pid, signal) == 0 },
        _ => false,
    }
}

/// Signal the process group led by `pid`, falling back to the pid itself.
///
/// A process that is already gone counts as success.
#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let Ok(pid) = i32::try_from(pid) else {
        return Ok(());
    };
    if pid <= 0 {
        return Ok(());
    }

    // SAFETY: `libc::kill` takes plain integers and touches no memory we own.
    unsafe {
        if libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 {
            return Ok(());
        }
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
