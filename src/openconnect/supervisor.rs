//! Privileged process supervision
//!
//! One openconnect launch at a time. The foreground `sudo` process is
//! watched until it exits; once openconnect has detached, the daemon is only
//! reachable through its pid file.

use super::command::{LaunchCommand, SecretInput};
use crate::config::OpenConnectConfig;
use crate::credentials::Credentials;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// How long output is still collected after the foreground process exits
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("openconnect is already running")]
    AlreadyRunning,
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write process input: {0}")]
    Input(#[source] std::io::Error),
    #[error("Failed to read pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to terminate process {pid}: {reason}")]
    Terminate { pid: i32, reason: String },
}

/// Outcome of a launched process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessReport {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// stdout and stderr lines, in arrival order
    pub output: String,
}

impl ProcessReport {
    /// Last `lines` lines of output
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.output.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Starts and stops the privileged process
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn `command`, feed its stdin and return a receiver that resolves
    /// once the process has exited
    async fn launch(&self, command: LaunchCommand) -> Result<oneshot::Receiver<ProcessReport>, SupervisorError>;

    /// Stop whatever the last launch left running. A no-op when idle.
    async fn terminate_process(&self, credentials: &Credentials) -> Result<(), SupervisorError>;

    /// Whether a launch from this launcher is still alive
    async fn is_running(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Where the detached daemon records its pid
    pub pid_file: Option<PathBuf>,
    /// Elevation tool used to signal the root-owned daemon; signals are sent
    /// directly when unset
    pub elevate_with: Option<PathBuf>,
    pub kill_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &OpenConnectConfig) -> Self {
        Self {
            pid_file: Some(config.pid_file.clone()),
            elevate_with: Some(config.sudo.clone()),
            kill_timeout: config.kill_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChildState {
    Running,
    Exited { success: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StopSignal {
    Term,
    Kill,
}

impl StopSignal {
    fn kill_arg(self) -> &'static str {
        match self {
            StopSignal::Term => "-TERM",
            StopSignal::Kill => "-KILL",
        }
    }

    #[cfg(unix)]
    fn as_nix(self) -> Signal {
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }
}

struct Slot {
    state: watch::Receiver<ChildState>,
    stop: Option<oneshot::Sender<()>>,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    slot: Mutex<Option<Slot>>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            slot: Mutex::new(None),
        }
    }

    /// Whether the last launch is still running, either in the foreground
    /// or as a detached daemon
    pub async fn is_active(&self) -> bool {
        let slot = self.slot.lock().await;
        slot.as_ref().is_some_and(|s| self.is_live(s))
    }

    /// Pid of a live daemon recorded in the pid file
    pub fn daemon_pid(&self) -> Result<Option<i32>, SupervisorError> {
        let Some(path) = &self.settings.pid_file else {
            return Ok(None);
        };
        Ok(read_pid_file(path)?.filter(|pid| pid_alive(*pid)))
    }

    /// Stop the daemon named in the pid file. Works without a prior launch
    /// from this process.
    pub async fn terminate_pid_file(&self, sudo_password: Option<&str>) -> Result<(), SupervisorError> {
        let Some(pid) = self.daemon_pid()? else {
            debug!("No running openconnect recorded in pid file");
            return Ok(());
        };

        info!("Stopping openconnect (pid {})", pid);
        self.send_signal(pid, StopSignal::Term, sudo_password).await?;

        let deadline = Instant::now() + self.settings.kill_timeout;
        while Instant::now() < deadline {
            if !pid_alive(pid) {
                info!("openconnect (pid {}) stopped", pid);
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        warn!("openconnect (pid {}) did not stop after SIGTERM, sending SIGKILL", pid);
        self.send_signal(pid, StopSignal::Kill, sudo_password).await
    }

    fn is_live(&self, slot: &Slot) -> bool {
        let state = *slot.state.borrow();
        match state {
            ChildState::Running => true,
            ChildState::Exited { success: false } => false,
            ChildState::Exited { success: true } => match self.daemon_pid() {
                Ok(pid) => pid.is_some() || self.settings.pid_file.is_none(),
                Err(e) => {
                    warn!("{}", e);
                    true
                }
            },
        }
    }

    async fn send_signal(
        &self,
        pid: i32,
        signal: StopSignal,
        sudo_password: Option<&str>,
    ) -> Result<(), SupervisorError> {
        let result = match &self.settings.elevate_with {
            Some(tool) => elevated_kill(tool, pid, signal, sudo_password).await,
            None => signal_pid(pid, signal),
        };
        match result {
            Err(_) if !pid_alive(pid) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl ProcessLauncher for Supervisor {
    async fn launch(&self, command: LaunchCommand) -> Result<oneshot::Receiver<ProcessReport>, SupervisorError> {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|s| self.is_live(s)) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let program = command.program.display().to_string();
        info!("Starting {} {}", program, command.args.join(" "));

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn { program, source })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(command.input.as_bytes()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Process closed stdin before reading all input");
                }
                Err(e) => {
                    abort_child(&mut child, self.settings.kill_timeout).await;
                    return Err(SupervisorError::Input(e));
                }
            }
        }

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (state_tx, state_rx) = watch::channel(ChildState::Running);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (report_tx, report_rx) = oneshot::channel();
        tokio::spawn(monitor(
            child,
            line_rx,
            stop_rx,
            state_tx,
            report_tx,
            self.settings.kill_timeout,
        ));

        *slot = Some(Slot {
            state: state_rx,
            stop: Some(stop_tx),
        });
        Ok(report_rx)
    }

    async fn terminate_process(&self, credentials: &Credentials) -> Result<(), SupervisorError> {
        let mut slot = self.slot.lock().await;
        let Some(current) = slot.as_mut() else {
            debug!("No process to terminate");
            return Ok(());
        };

        let state = *current.state.borrow();
        match state {
            ChildState::Running => {
                if let Some(stop) = current.stop.take() {
                    let _ = stop.send(());
                }
                let mut state_rx = current.state.clone();
                while *state_rx.borrow_and_update() == ChildState::Running {
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                }
            }
            ChildState::Exited { success: true } => {
                self.terminate_pid_file(credentials.sudo_password.as_deref()).await?;
            }
            ChildState::Exited { success: false } => {}
        }

        *slot = None;
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.is_active().await
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    // Keep reading after the receiver is gone so the daemon never writes into a closed pipe
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "openconnect", "{}", line);
        let _ = tx.send(line);
    }
}

async fn monitor(
    mut child: Child,
    mut lines: mpsc::UnboundedReceiver<String>,
    stop: oneshot::Receiver<()>,
    state: watch::Sender<ChildState>,
    report: oneshot::Sender<ProcessReport>,
    kill_timeout: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = stop => stop_child(&mut child, kill_timeout).await,
    };

    let (exit_code, success) = match &status {
        Ok(status) => (status.code(), status.success()),
        Err(e) => {
            warn!("Failed to wait for process: {}", e);
            (None, false)
        }
    };
    info!(code = ?exit_code, "Privileged process exited");
    let _ = state.send(ChildState::Exited { success });

    let mut output = Vec::new();
    let deadline = Instant::now() + OUTPUT_DRAIN;
    while let Ok(Some(line)) = tokio::time::timeout_at(deadline, lines.recv()).await {
        output.push(line);
    }

    let _ = report.send(ProcessReport {
        exit_code,
        success,
        output: output.join("\n"),
    });
}

#[cfg(unix)]
fn request_stop(child: &mut Child) -> std::io::Result<()> {
    if let Some(pid) = child.id() {
        debug!("Sending SIGTERM to pid {}", pid);
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    Ok(())
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

async fn stop_child(child: &mut Child, kill_timeout: Duration) -> std::io::Result<ExitStatus> {
    request_stop(child)?;

    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Process ignored SIGTERM, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Kill a child that never got going and reap it
async fn abort_child(child: &mut Child, kill_timeout: Duration) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to kill process: {}", e);
    }
    if tokio::time::timeout(kill_timeout, child.wait()).await.is_err() {
        warn!("Process did not exit after SIGKILL");
    }
}

async fn elevated_kill(
    tool: &Path,
    pid: i32,
    signal: StopSignal,
    sudo_password: Option<&str>,
) -> Result<(), SupervisorError> {
    let password = sudo_password.ok_or_else(|| SupervisorError::Terminate {
        pid,
        reason: "superuser password unavailable".to_string(),
    })?;
    let pid_arg = pid.to_string();

    let mut child = Command::new(tool)
        .args(["-k", "-S", "kill", signal.kill_arg(), pid_arg.as_str()])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            program: tool.display().to_string(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let input = SecretInput::from_lines([password]);
        stdin.write_all(input.as_bytes()).await.map_err(SupervisorError::Input)?;
    }

    let output = child.wait_with_output().await.map_err(|e| SupervisorError::Terminate {
        pid,
        reason: e.to_string(),
    })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(SupervisorError::Terminate {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(unix)]
fn signal_pid(pid: i32, signal: StopSignal) -> Result<(), SupervisorError> {
    match kill(Pid::from_raw(pid), signal.as_nix()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Terminate {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn signal_pid(pid: i32, _signal: StopSignal) -> Result<(), SupervisorError> {
    Err(SupervisorError::Terminate {
        pid,
        reason: "signals are not supported on this platform".to_string(),
    })
}

fn read_pid_file(path: &Path) -> Result<Option<i32>, SupervisorError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SupervisorError::PidFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None::<Signal>) {
        // EPERM: alive but owned by root
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}
