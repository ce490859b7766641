//! Agent process supervisor.
//!
//! Launches the agent executable, drains its stdout/stderr into observers,
//! relaunches it with backoff after a failing exit, and terminates it
//! gracefully (SIGTERM, grace period, then kill) on request.
//!
//! Each supervised process publishes its lifecycle on a `watch` channel so
//! callers can react to restarts without polling.

use crate::retry::{compute_backoff, RetryConfig};
use dashmap::DashMap;
use meshlink_types::{MeshLinkError, MeshLinkResult, RestartPolicy};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Unique process identifier.
pub type ProcessId = String;

/// Callback invoked with each line the agent writes to stdout or stderr.
pub type OutputObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// What to launch and how to supervise it.
#[derive(Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Relaunch after a non-zero exit.
    pub restart_on_failure: bool,
    pub restart: RestartPolicy,
    /// Time allowed between SIGTERM and a forced kill.
    pub grace: Duration,
    pub on_stdout: Option<OutputObserver>,
    pub on_stderr: Option<OutputObserver>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            restart_on_failure: false,
            restart: RestartPolicy::default(),
            grace: Duration::from_secs(3),
            on_stdout: None,
            on_stderr: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn restart_on_failure(mut self, policy: RestartPolicy) -> Self {
        self.restart_on_failure = true;
        self.restart = policy;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn on_stdout(mut self, observer: OutputObserver) -> Self {
        self.on_stdout = Some(observer);
        self
    }

    pub fn on_stderr(mut self, observer: OutputObserver) -> Self {
        self.on_stderr = Some(observer);
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.display().to_string()
        } else {
            format!("{} {}", self.program.display(), self.args.join(" "))
        }
    }
}

impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("restart_on_failure", &self.restart_on_failure)
            .field("restart", &self.restart)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Alive. `generation` starts at 1 and increases with every relaunch.
    Running { pid: Option<u32>, generation: u64 },
    /// Waiting `delay_ms` before relaunch number `attempt`.
    Restarting { attempt: u32, delay_ms: u64 },
    /// Exited on its own and will not be relaunched.
    Exited { code: Option<i32> },
    /// Kept failing past the restart ceiling.
    Failed { restarts: u32, reason: String },
    /// Terminated on request.
    Stopped,
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// No further transitions will happen.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Failed { .. } | Self::Stopped)
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Running { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running { pid: Some(pid), generation } => {
                write!(f, "running (pid {pid}, generation {generation})")
            }
            Self::Running { pid: None, generation } => write!(f, "running (generation {generation})"),
            Self::Restarting { attempt, delay_ms } => {
                write!(f, "restarting (attempt {attempt} in {delay_ms}ms)")
            }
            Self::Exited { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Exited { code: None } => write!(f, "exited by signal"),
            Self::Failed { restarts, reason } => {
                write!(f, "failed after {restarts} restarts: {reason}")
            }
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Handle to a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    status: watch::Receiver<ProcessStatus>,
}

impl ProcessHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status.
    pub fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `pred`, or until supervision has
    /// ended, and return the status observed.
    pub async fn wait_for(&self, mut pred: impl FnMut(&ProcessStatus) -> bool) -> ProcessStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(|s| pred(s)).await {
            return status.clone();
        }
        let last = rx.borrow().clone();
        last
    }
}

/// Supervision bookkeeping for one process.
struct ManagedProcess {
    stop_tx: watch::Sender<bool>,
    monitor: JoinHandle<()>,
    status: watch::Receiver<ProcessStatus>,
}

/// Launches and supervises agent processes.
pub struct ProcessSupervisor {
    processes: DashMap<ProcessId, ManagedProcess>,
    next_id: AtomicU64,
    restarts: Arc<AtomicU64>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            processes: DashMap::new(),
            next_id: AtomicU64::new(1),
            restarts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Launch a process and begin supervising it.
    ///
    /// The first launch happens before this returns, so a missing or
    /// unlaunchable executable is reported here as `LaunchFailed`.
    pub async fn start(&self, spec: LaunchSpec) -> MeshLinkResult<ProcessHandle> {
        ensure_executable(&spec.program)?;
        let child = spawn_child(&spec)?;
        let pid = child.id();

        let id = format!("agent_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let command = spec.display();
        info!(id = %id, pid, command = %command, "Agent process started");

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running { pid, generation: 1 });
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = tokio::spawn(monitor(
            id.clone(),
            child,
            spec,
            status_tx,
            stop_rx,
            self.restarts.clone(),
        ));

        self.processes.insert(
            id.clone(),
            ManagedProcess {
                stop_tx,
                monitor,
                status: status_rx.clone(),
            },
        );

        Ok(ProcessHandle {
            id,
            status: status_rx,
        })
    }

    /// Stop supervising and terminate the process. Stopping a process that
    /// is already stopped (or unknown) does nothing.
    pub async fn stop(&self, handle: &ProcessHandle) {
        let Some((id, managed)) = self.processes.remove(handle.id()) else {
            debug!(id = handle.id(), "Process already stopped");
            return;
        };
        managed.stop_tx.send_replace(true);
        if let Err(e) = managed.monitor.await {
            warn!(id = %id, "Supervisor task ended abnormally: {e}");
        }
        debug!(id = %id, status = %*managed.status.borrow(), "Process supervision ended");
    }

    /// Relaunches performed across all processes.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Watches one process: relaunches it on failure, terminates it on request.
async fn monitor(
    id: ProcessId,
    mut child: Child,
    spec: LaunchSpec,
    status_tx: watch::Sender<ProcessStatus>,
    mut stop_rx: watch::Receiver<bool>,
    restarts: Arc<AtomicU64>,
) {
    let backoff = RetryConfig::from(&spec.restart);
    let stable_after = Duration::from_secs(spec.restart.stable_after_secs);
    let mut generation = 1u64;
    let mut attempt = 0u32;

    loop {
        let launched_at = Instant::now();
        let waited = tokio::select! {
            waited = child.wait() => waited,
            _ = stop_requested(&mut stop_rx) => {
                terminate(&id, &mut child, spec.grace).await;
                status_tx.send_replace(ProcessStatus::Stopped);
                return;
            }
        };

        let (code, success) = match waited {
            Ok(status) => (status.code(), status.success()),
            Err(e) => {
                warn!(id = %id, "Failed to wait on agent process: {e}");
                (None, false)
            }
        };

        if success || !spec.restart_on_failure {
            info!(id = %id, code, "Agent process exited");
            status_tx.send_replace(ProcessStatus::Exited { code });
            return;
        }

        if launched_at.elapsed() >= stable_after {
            attempt = 0;
        }
        let mut reason = match code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        };

        // Relaunch until one succeeds, the ceiling is hit, or stop is requested.
        loop {
            attempt += 1;
            if !backoff.allows(attempt) {
                let restarts = attempt - 1;
                error!(id = %id, restarts, "Agent keeps failing, giving up: {reason}");
                status_tx.send_replace(ProcessStatus::Failed { restarts, reason });
                return;
            }

            let delay_ms = compute_backoff(&backoff, attempt - 1);
            warn!(id = %id, attempt, delay_ms, "Agent {reason}, restarting");
            status_tx.send_replace(ProcessStatus::Restarting { attempt, delay_ms });

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = stop_requested(&mut stop_rx) => {
                    status_tx.send_replace(ProcessStatus::Stopped);
                    return;
                }
            }

            restarts.fetch_add(1, Ordering::Relaxed);
            match spawn_child(&spec) {
                Ok(relaunched) => {
                    child = relaunched;
                    generation += 1;
                    let pid = child.id();
                    info!(id = %id, pid, generation, "Agent process relaunched");
                    status_tx.send_replace(ProcessStatus::Running { pid, generation });
                    break;
                }
                Err(e) => {
                    warn!(id = %id, attempt, "Relaunch failed: {e}");
                    reason = e.to_string();
                }
            }
        }
    }
}

/// Resolves once a stop has been requested or the supervisor is gone.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

fn spawn_child(spec: &LaunchSpec) -> MeshLinkResult<Child> {
    let mut child = tokio::process::Command::new(&spec.program)
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            MeshLinkError::LaunchFailed(format!("{}: {e}", spec.program.display()))
        })?;

    let pid = child.id();
    if let Some(out) = child.stdout.take() {
        pipe_lines(out, spec.on_stdout.clone(), "stdout", pid);
    }
    if let Some(err) = child.stderr.take() {
        pipe_lines(err, spec.on_stderr.clone(), "stderr", pid);
    }
    Ok(child)
}

/// Forward each line of `stream` to `observer`, or to the debug log if none.
fn pipe_lines<S>(stream: S, observer: Option<OutputObserver>, stream_name: &'static str, pid: Option<u32>)
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match &observer {
                Some(observer) => observer(&line),
                None => debug!(pid, stream = stream_name, "{line}"),
            }
        }
    });
}

/// Ask the process to exit, wait up to `grace`, then kill it.
async fn terminate(id: &str, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if request_exit(pid).await {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {
                    debug!(id, pid, "Agent exited after stop request");
                    return;
                }
                Err(_) => warn!(id, pid, "Agent ignored stop request for {grace:?}, killing"),
            }
        }
        force_kill_tree(pid).await;
    }

    if let Err(e) = child.kill().await {
        debug!(id, "Kill failed (process likely already exited): {e}");
    }
}

/// Polite stop request: SIGTERM. Returns whether it was delivered.
#[cfg(unix)]
async fn request_exit(pid: u32) -> bool {
    run_quietly("kill", &["-TERM", &pid.to_string()]).await
}

/// Polite stop request: `taskkill` without `/F` posts WM_CLOSE to the tree.
#[cfg(windows)]
async fn request_exit(pid: u32) -> bool {
    run_quietly("taskkill", &["/T", "/PID", &pid.to_string()]).await
}

#[cfg(not(any(unix, windows)))]
async fn request_exit(_pid: u32) -> bool {
    false
}

#[cfg(windows)]
async fn force_kill_tree(pid: u32) {
    if !run_quietly("taskkill", &["/F", "/T", "/PID", &pid.to_string()]).await {
        debug!(pid, "taskkill /F failed (process likely already exited)");
    }
}

#[cfg(not(windows))]
async fn force_kill_tree(_pid: u32) {}

#[cfg(any(unix, windows))]
async fn run_quietly(program: &str, args: &[&str]) -> bool {
    tokio::process::Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Make sure the agent has its execute bits; builds are sometimes unpacked
/// without them.
#[cfg(unix)]
fn ensure_executable(path: &Path) -> MeshLinkResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path)
        .map_err(|e| MeshLinkError::LaunchFailed(format!("{}: {e}", path.display())))?;
    let mode = meta.permissions().mode();
    if mode & 0o111 == 0o111 {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o755)).map_err(|e| {
        MeshLinkError::LaunchFailed(format!("cannot mark {} executable: {e}", path.display()))
    })
}

#[cfg(not(unix))]
fn ensure_executable(path: &Path) -> MeshLinkResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(MeshLinkError::LaunchFailed(format!(
            "{}: not a file",
            path.display()
        )))
    }
}
