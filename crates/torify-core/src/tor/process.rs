//! Launching the tor daemon and discovering its control port.
//!
//! Tor is started with `ControlPort auto`, so the only way to learn the port
//! is to watch the daemon's log output for the line announcing it.
//!
//! On daemonizing platforms the launched process exits once the daemon is
//! in the background. The daemon then overwrites the owner pid in the pid
//! file with its own, which is what [`TorProcess::terminate`] signals.

use super::{CONTROL_LISTENING_PREFIX, CONTROL_OPENED_PREFIX};
use crate::error::{Error, Result};
use crate::install::{Platform, TorLayout};
use crate::shutdown::ShutdownSignal;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// How long to wait for a process whose output ended to report its exit,
/// and for a signalled daemon to go away.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Interval between checks whether a signalled daemon is gone.
#[cfg(unix)]
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to launch a daemon.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Tor executable.
    pub binary: PathBuf,
    /// Torrc passed with `-f`.
    pub torrc: PathBuf,
    /// Working directory, `HOME`, and (on Linux) library search path.
    pub data_dir: PathBuf,
    /// File receiving the owner pid before launch, and the daemon's pid
    /// once it runs.
    pub pid_file: PathBuf,
    /// Pid the daemon binds its lifetime to.
    pub owner_pid: u32,
    /// Target platform.
    pub platform: Platform,
}

impl LaunchSpec {
    /// Launch settings for the files of `layout`, owned by this process.
    pub fn from_layout(layout: &TorLayout, platform: Platform) -> Self {
        Self {
            binary: layout.binary(platform),
            torrc: layout.torrc_file(),
            data_dir: layout.tor_dir().to_path_buf(),
            pid_file: layout.pid_file(),
            owner_pid: std::process::id(),
            platform,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f")
            .arg(&self.torrc)
            .arg("--ignore-missing-torrc")
            .arg("__OwningControllerProcess")
            .arg(self.owner_pid.to_string())
            .current_dir(&self.data_dir)
            .env("HOME", &self.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.platform.sets_library_path() {
            cmd.env("LD_LIBRARY_PATH", &self.data_dir);
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputSource {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputLine {
    source: OutputSource,
    line: String,
}

/// Daemon running on its own after the launcher exited.
#[derive(Debug)]
struct Detached {
    pid_file: PathBuf,
    owner_pid: u32,
    /// Read from the pid file when the launcher exited.
    pid: Option<u32>,
}

impl Detached {
    fn pid(&self) -> Option<u32> {
        self.pid.or_else(|| read_daemon_pid(&self.pid_file, self.owner_pid))
    }
}

/// A launched daemon whose control port is known.
#[derive(Debug)]
pub struct TorProcess {
    /// Present while the launched process is still attached to us.
    child: Option<Child>,
    /// Present on daemonizing platforms until terminated.
    detached: Option<Detached>,
    control_port: u16,
}

impl TorProcess {
    /// Launch the daemon and wait until it announces its control port.
    ///
    /// On daemonizing platforms this also waits for the launcher to exit
    /// cleanly once the background daemon is up.
    pub async fn start(spec: &LaunchSpec, shutdown: &ShutdownSignal) -> Result<Self> {
        shutdown.check()?;

        std::fs::write(&spec.pid_file, spec.owner_pid.to_string())
            .map_err(|e| Error::persistence(&spec.pid_file, e))?;

        let mut child = spec.command().spawn().map_err(Error::ProcessStart)?;
        tracing::info!(
            pid = ?child.id(),
            binary = %spec.binary.display(),
            owner_pid = spec.owner_pid,
            "Launched tor"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputSource::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputSource::Stderr, tx.clone()));
        }
        drop(tx);

        let discovered = tokio::select! {
            _ = shutdown.requested() => {
                kill(&mut child).await;
                return Err(Error::Cancelled);
            }
            port = find_control_port(&mut rx) => port,
        };

        let Some(control_port) = discovered else {
            return Err(exit_without_port(&mut child, shutdown).await);
        };
        tracing::info!(control_port, "Tor control port discovered");

        tokio::spawn(drain(rx));

        let (child, detached) = if spec.platform.daemonizes() {
            let status = tokio::select! {
                _ = shutdown.requested() => {
                    kill(&mut child).await;
                    return Err(Error::Cancelled);
                }
                status = child.wait() => status?,
            };
            if !status.success() {
                return Err(Error::AbnormalExit(exit_code(status)));
            }
            let pid = read_daemon_pid(&spec.pid_file, spec.owner_pid);
            tracing::debug!(daemon_pid = ?pid, "Tor launcher exited, daemon running in background");
            let detached = Detached {
                pid_file: spec.pid_file.clone(),
                owner_pid: spec.owner_pid,
                pid,
            };
            (None, Some(detached))
        } else {
            (Some(child), None)
        };

        Ok(Self {
            child,
            detached,
            control_port,
        })
    }

    /// Port the daemon's control listener is bound to.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Whether the launched process is still attached (non-daemonizing
    /// platforms).
    pub fn is_attached(&self) -> bool {
        self.child.is_some()
    }

    /// Pid of the background daemon, once it has written its pid file.
    pub fn daemon_pid(&self) -> Option<u32> {
        self.detached.as_ref().and_then(Detached::pid)
    }

    /// Force-kill the attached process, or signal the background daemon.
    /// Idempotent.
    pub async fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill(&mut child).await;
            tracing::info!("Tor process terminated");
        }
        if let Some(detached) = self.detached.take() {
            match detached.pid() {
                Some(pid) => stop_daemon(pid).await,
                None => tracing::debug!("Tor daemon never wrote its pid, nothing to stop"),
            }
        }
    }
}

/// Pid in `pid_file`, unless it is still the owner pid written before
/// launch.
fn read_daemon_pid(pid_file: &Path, owner_pid: u32) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(pid_file).ok()?.trim().parse().ok()?;
    (pid > 1 && pid != owner_pid && pid != std::process::id()).then_some(pid)
}

/// SIGTERM the daemon, then SIGKILL it if it is still around after
/// [`EXIT_GRACE`].
#[cfg(unix)]
async fn stop_daemon(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let target = Pid::from_raw(raw);
    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "Tor daemon already gone");
            return;
        }
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to signal tor daemon");
            return;
        }
    }

    let deadline = tokio::time::Instant::now() + EXIT_GRACE;
    while tokio::time::Instant::now() < deadline {
        if kill(target, None).is_err() {
            tracing::info!(pid, "Tor daemon terminated");
            return;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    match kill(target, Signal::SIGKILL) {
        Ok(()) => tracing::warn!(pid, "Tor daemon ignored SIGTERM, killed"),
        Err(e) => tracing::debug!(pid, error = %e, "Failed to kill tor daemon"),
    }
}

#[cfg(not(unix))]
async fn stop_daemon(pid: u32) {
    tracing::warn!(pid, "Cannot signal a detached tor daemon on this platform");
}

/// Extract the control port from a daemon log line.
pub fn parse_control_port(line: &str) -> Option<u16> {
    if let Some(idx) = line.find(CONTROL_LISTENING_PREFIX) {
        let rest = &line[idx + CONTROL_LISTENING_PREFIX.len()..];
        return parse_port(rest);
    }
    if let Some(idx) = line.find(CONTROL_OPENED_PREFIX) {
        let rest = &line[idx + CONTROL_OPENED_PREFIX.len()..];
        return rest.rsplit(':').next().and_then(parse_port);
    }
    None
}

fn parse_port(s: &str) -> Option<u16> {
    s.trim().trim_end_matches('.').parse().ok()
}

async fn pump<R>(reader: R, source: OutputSource, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(OutputLine { source, line }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(?source, error = %e, "Tor output stream failed");
                break;
            }
        }
    }
}

/// Consume output until the control port line shows up or both streams end.
async fn find_control_port(rx: &mut mpsc::UnboundedReceiver<OutputLine>) -> Option<u16> {
    while let Some(output) = rx.recv().await {
        log_line(&output);
        if output.source == OutputSource::Stdout {
            if let Some(port) = parse_control_port(&output.line) {
                return Some(port);
            }
        }
    }
    None
}

async fn drain(mut rx: mpsc::UnboundedReceiver<OutputLine>) {
    while let Some(output) = rx.recv().await {
        log_line(&output);
    }
}

fn log_line(output: &OutputLine) {
    match output.source {
        OutputSource::Stdout => tracing::debug!(target: "torify::tor_output", "{}", output.line),
        OutputSource::Stderr => tracing::error!(target: "torify::tor_output", "{}", output.line),
    }
}

/// Classify a daemon whose output ended before it announced a control port.
async fn exit_without_port(child: &mut Child, shutdown: &ShutdownSignal) -> Error {
    let waited = tokio::select! {
        _ = shutdown.requested() => {
            kill(child).await;
            return Error::Cancelled;
        }
        waited = tokio::time::timeout(EXIT_GRACE, child.wait()) => waited,
    };
    match waited {
        Ok(Ok(status)) if !status.success() => Error::AbnormalExit(exit_code(status)),
        Ok(Ok(_)) => Error::ControlPortNotFound,
        Ok(Err(e)) => Error::Io(e),
        Err(_) => {
            kill(child).await;
            Error::ControlPortNotFound
        }
    }
}

/// Exit code, or -1 when the process was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Failed to kill tor process");
    }
}
