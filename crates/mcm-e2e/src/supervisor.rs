//! Supervised execution of the controllers under test
//!
//! A [`ProcessSupervisor`] owns one cancellation scope and one task group.
//! Every started process is watched by a task in that group; cancelling the
//! scope makes each task terminate its process group (SIGTERM, then SIGKILL
//! once the grace period runs out). Controllers are not trusted to react to
//! SIGTERM.
//!
//! Process output is written to a per-process log file and never goes
//! through tracing.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How long a cancelled process may take to exit before it is killed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Interval between checks for surviving process group members
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for a killed group to disappear
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// Program and arguments, kept apart so nothing is ever re-split by a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `make start` with the control and target kubeconfigs, the launch
    /// convention of both controllers
    pub fn make_start(control_kubeconfig: &Path, target_kubeconfig: &Path) -> Self {
        Self::new("make")
            .arg("start")
            .arg(format!("CONTROL_KUBECONFIG={}", control_kubeconfig.display()))
            .arg(format!("TARGET_KUBECONFIG={}", target_kubeconfig.display()))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Everything needed to start one supervised process
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub command: CommandSpec,
    pub work_dir: PathBuf,
    pub log_path: PathBuf,
}

impl ProcessSpec {
    pub fn new(
        name: impl Into<String>,
        command: CommandSpec,
        work_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            work_dir: work_dir.into(),
            log_path: log_path.into(),
        }
    }
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Cancelled,
    ExitedCleanly,
    ExitedWithError { code: Option<i32> },
    /// Process gone and its log file closed
    Reaped,
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Stopped by cancellation; `forced` if it had to be killed
    Cancelled { forced: bool },
    Clean,
    /// `code` is `None` when the process died from a signal
    Failed { code: Option<i32> },
}

impl ExitOutcome {
    fn state(self) -> ProcessState {
        match self {
            ExitOutcome::Cancelled { .. } => ProcessState::Cancelled,
            ExitOutcome::Clean => ProcessState::ExitedCleanly,
            ExitOutcome::Failed { code } => ProcessState::ExitedWithError { code },
        }
    }
}

/// Record of a process that has been reaped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub name: String,
    pub log_path: PathBuf,
    pub outcome: ExitOutcome,
}

/// Caller-side view of a started process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    log_path: PathBuf,
    state: watch::Receiver<ProcessState>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Wait until the process is gone and its log file is closed
    pub async fn reaped(&self) {
        let mut rx = self.state.clone();
        // A dropped sender means the watcher task is gone as well
        let _ = rx.wait_for(|s| *s == ProcessState::Reaped).await;
    }
}

/// A spawned child plus the resources that must be released with it
struct ManagedProcess {
    name: String,
    child: Child,
    /// Process group led by `child`; still valid after the leader is reaped
    pgid: Option<u32>,
    log: File,
    log_path: PathBuf,
    state: watch::Sender<ProcessState>,
}

/// Owns the controllers started for a suite run.
///
/// Invariant: `live_count()` equals the number of processes in
/// [`ProcessState::Running`]. Log paths are claimed for the lifetime of the
/// supervisor and can't be handed to a second process.
pub struct ProcessSupervisor {
    cancel: CancellationToken,
    tracker: TaskTracker,
    live: Arc<AtomicUsize>,
    grace: Duration,
    log_owners: Mutex<HashMap<PathBuf, String>>,
    exits: Arc<Mutex<Vec<ProcessExit>>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ProcessSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            live: Arc::new(AtomicUsize::new(0)),
            grace,
            log_owners: Mutex::new(HashMap::new()),
            exits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn `spec` with stdout and stderr merged into its log file.
    ///
    /// The log file is created or truncated. Failing to create it, or to
    /// spawn the program, is a [`Error::Spawn`].
    pub fn start(&self, spec: ProcessSpec) -> Result<ProcessHandle> {
        if self.cancel.is_cancelled() {
            return Err(Error::SupervisorCancelled { name: spec.name });
        }

        let log_path = std::path::absolute(&spec.log_path).map_err(|source| Error::Spawn {
            name: spec.name.clone(),
            source,
        })?;
        self.claim_log(&log_path, &spec.name)?;

        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
        let (child, log) = match spawn(&spec, &log_path) {
            Ok(spawned) => spawned,
            Err(source) => {
                self.log_owners.lock().remove(&log_path);
                return Err(Error::Spawn {
                    name: spec.name,
                    source,
                });
            }
        };

        let pid = child.id();
        self.live.fetch_add(1, Ordering::SeqCst);
        state_tx.send_replace(ProcessState::Running);
        info!(
            name = %spec.name,
            pid = ?pid,
            command = %spec.command,
            work_dir = %spec.work_dir.display(),
            log = %log_path.display(),
            "Started supervised process"
        );

        let process = ManagedProcess {
            name: spec.name.clone(),
            child,
            pgid: pid,
            log,
            log_path: log_path.clone(),
            state: state_tx,
        };
        self.tracker.spawn(watch_process(
            process,
            self.cancel.clone(),
            self.grace,
            self.live.clone(),
            self.exits.clone(),
        ));

        Ok(ProcessHandle {
            name: spec.name,
            pid,
            log_path,
            state: state_rx,
        })
    }

    fn claim_log(&self, log_path: &Path, name: &str) -> Result<()> {
        let mut owners = self.log_owners.lock();
        if let Some(owner) = owners.get(log_path) {
            return Err(Error::DuplicateLogPath {
                path: log_path.to_path_buf(),
                owner: owner.clone(),
            });
        }
        owners.insert(log_path.to_path_buf(), name.to_string());
        Ok(())
    }

    /// Fire the cancellation scope. Idempotent; no process can be started
    /// afterwards.
    pub fn cancel_all(&self) {
        if !self.cancel.is_cancelled() {
            info!(live = self.live_count(), "Cancelling supervised processes");
        }
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Wait until every started process has been reaped.
    ///
    /// Without a prior [`cancel_all`](Self::cancel_all) this waits for the
    /// processes to exit on their own. Non-zero exits are reported in the
    /// returned records, never as an error.
    pub async fn await_all_terminated(&self) -> Vec<ProcessExit> {
        self.tracker.close();
        self.tracker.wait().await;
        self.exits.lock().clone()
    }

    /// [`cancel_all`](Self::cancel_all) followed by
    /// [`await_all_terminated`](Self::await_all_terminated)
    pub async fn shutdown(&self) -> Vec<ProcessExit> {
        self.cancel_all();
        self.await_all_terminated().await
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Watcher tasks still get to kill their process groups
        self.cancel.cancel();
    }
}

fn spawn(spec: &ProcessSpec, log_path: &Path) -> io::Result<(Child, File)> {
    let log = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(log_path)?;

    let mut cmd = Command::new(&spec.command.program);
    cmd.args(&spec.command.args)
        .current_dir(&spec.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log.try_clone()?))
        .kill_on_drop(true);
    // Own process group, so `make` and everything it forks can be signalled at once
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    Ok((child, log))
}

async fn watch_process(
    mut process: ManagedProcess,
    cancel: CancellationToken,
    grace: Duration,
    live: Arc<AtomicUsize>,
    exits: Arc<Mutex<Vec<ProcessExit>>>,
) {
    enum Wake {
        Exited(io::Result<ExitStatus>),
        Cancelled,
    }

    let wake = tokio::select! {
        status = process.child.wait() => Wake::Exited(status),
        _ = cancel.cancelled() => Wake::Cancelled,
    };
    let outcome = match wake {
        Wake::Exited(status) => classify(&process.name, status),
        Wake::Cancelled => {
            terminate(&mut process.child, process.pgid, &process.name, grace).await
        }
    };

    live.fetch_sub(1, Ordering::SeqCst);
    process.state.send_replace(outcome.state());

    match outcome {
        ExitOutcome::Failed { code } => warn!(
            name = %process.name,
            code = ?code,
            log = %process.log_path.display(),
            "Supervised process exited with error"
        ),
        _ => info!(name = %process.name, outcome = ?outcome, "Supervised process stopped"),
    }

    let ManagedProcess {
        name,
        log,
        log_path,
        state,
        ..
    } = process;
    if let Err(e) = log.sync_all() {
        warn!(name = %name, error = %e, "Failed to flush process log");
    }
    drop(log);

    exits.lock().push(ProcessExit {
        name,
        log_path,
        outcome,
    });
    state.send_replace(ProcessState::Reaped);
}

fn classify(name: &str, status: io::Result<ExitStatus>) -> ExitOutcome {
    match status {
        Ok(status) if status.success() => ExitOutcome::Clean,
        Ok(status) => ExitOutcome::Failed {
            code: status.code(),
        },
        Err(e) => {
            warn!(name = %name, error = %e, "Failed to wait for supervised process");
            ExitOutcome::Failed { code: None }
        }
    }
}

/// SIGTERM the process group, then SIGKILL whatever is left of it once
/// `grace` has passed.
///
/// The leader exiting is not enough: `make` dies on SIGTERM while the
/// controller it forked may ignore it.
async fn terminate(
    child: &mut Child,
    pgid: Option<u32>,
    name: &str,
    grace: Duration,
) -> ExitOutcome {
    let deadline = Instant::now() + grace;
    signal_group(pgid, Signal::Term);

    let leader_exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
    while group_alive(pgid) && Instant::now() < deadline {
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
    if leader_exited && !group_alive(pgid) {
        return ExitOutcome::Cancelled { forced: false };
    }

    warn!(
        name = %name,
        grace_ms = grace.as_millis() as u64,
        leader_exited,
        "Process group ignored SIGTERM, killing"
    );
    signal_group(pgid, Signal::Kill);
    if !leader_exited {
        if let Err(e) = child.kill().await {
            warn!(name = %name, error = %e, "Failed to kill supervised process");
        }
    }

    let settle = Instant::now() + KILL_SETTLE;
    while group_alive(pgid) && Instant::now() < settle {
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
    ExitOutcome::Cancelled { forced: true }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: Signal) {
    let Some(pid) = pgid else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid signals the process group the
    // child leads. ESRCH only means the group is already gone.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if rc != 0 {
        debug!(pid, signal = ?signal, error = %io::Error::last_os_error(), "Group signal failed");
    }
}

/// Whether any member of the group is left, zombies included
#[cfg(unix)]
fn group_alive(pgid: Option<u32>) -> bool {
    let Some(pid) = pgid else {
        return false;
    };
    // SAFETY: signal 0 only checks that the group exists.
    unsafe { libc::kill(-(pid as libc::pid_t), 0) == 0 }
}

// Without process groups only the leader is signalled, through `Child`
#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _signal: Signal) {}

#[cfg(not(unix))]
fn group_alive(_pgid: Option<u32>) -> bool {
    false
}
