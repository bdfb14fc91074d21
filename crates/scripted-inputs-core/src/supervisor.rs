//! Process Supervisor: start, watch and stop one script process.
//!
//! Each script runs in its own process group so that termination signals
//! reach everything it forked. A watcher task owns the child, reaps it and
//! fires the [`DoneSignal`].
//!
//! ```text
//! NotStarted ──start──▶ Running ──exit / SIGTERM──▶ Exited
//!                          │
//!                          └──graceful timeout, SIGKILL──▶ Killed
//! ```

use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_INTERPRETER;
use crate::error::{IntegrityError, LaunchError, TerminationError};
use crate::integrity::IntegrityGuard;

/// Wait between SIGTERM and SIGKILL.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of one supervised process. `Exited` and `Killed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    NotStarted,
    Running,
    /// Natural exit, or exit after SIGTERM.
    Exited,
    /// Reaped after SIGKILL.
    Killed,
}

impl ProcessState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed)
    }
}

/// Result of [`ProcessSupervisor::start`].
#[derive(Debug)]
pub enum StartOutcome {
    Started,
    /// The integrity gate refused the script; nothing was spawned.
    Skipped(IntegrityError),
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Program the script path is handed to. `None` executes the script.
    pub interpreter: Option<String>,
    pub graceful_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            interpreter: Some(DEFAULT_INTERPRETER.to_string()),
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
        }
    }
}

/// Completion signal of one process. Clones observe the same event.
#[derive(Debug, Clone)]
pub struct DoneSignal {
    rx: watch::Receiver<bool>,
}

impl DoneSignal {
    /// Resolves once the process reached a terminal state. Returns right
    /// away on every later call.
    pub async fn wait(&mut self) {
        // Err means the supervisor was dropped without ever starting.
        let _ = self.rx.wait_for(|done| *done).await;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }
}

#[derive(Debug, Default)]
struct Status {
    state: ProcessState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    started_at: Option<SystemTime>,
}

#[derive(Debug)]
struct Inner {
    guard: IntegrityGuard,
    script_name: String,
    options: SupervisorOptions,
    status: Mutex<Status>,
    start_attempted: AtomicBool,
    stop_requested: AtomicBool,
    forced: AtomicBool,
    done_tx: watch::Sender<bool>,
}

impl Inner {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn watch(self: Arc<Self>, mut child: Child, pid: u32) {
        let (state, exit_code) = match child.wait().await {
            Ok(status) => classify(status, self.forced.load(Ordering::SeqCst)),
            Err(err) => {
                error!(pid, error = %err, "Failed to wait for script process");
                (ProcessState::Exited, -1)
            }
        };

        {
            let mut status = self.status();
            status.state = state;
            status.exit_code = Some(exit_code);
        }
        debug!(pid, exit_code, ?state, "Script process reaped");
        self.done_tx.send_replace(true);
    }
}

fn classify(status: ExitStatus, forced: bool) -> (ProcessState, i32) {
    let exit_code = status.code().unwrap_or(-1);
    let killed = forced && status.signal() == Some(Signal::SIGKILL as i32);
    let state = if killed {
        ProcessState::Killed
    } else {
        ProcessState::Exited
    };
    (state, exit_code)
}

/// Send `signal` to every process in group `pgid`. `Ok(false)` when the
/// group no longer exists.
fn signal_group(pgid: u32, signal: Signal) -> Result<bool, TerminationError> {
    let fail = |reason: String| TerminationError::Signal {
        signal: signal.as_str(),
        pgid,
        reason,
    };
    let raw = i32::try_from(pgid).map_err(|_| fail("pid out of range".to_string()))?;
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(fail(errno.desc().to_string())),
    }
}

/// Owns the lifecycle of a single script process.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(guard: IntegrityGuard, script_name: impl Into<String>, options: SupervisorOptions) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                guard,
                script_name: script_name.into(),
                options,
                status: Mutex::new(Status::default()),
                start_attempted: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                forced: AtomicBool::new(false),
                done_tx,
            }),
        }
    }

    /// Verify the script, then spawn it with stdout and stderr writing to
    /// `output`. `working_dir` defaults to the scripts root.
    ///
    /// A refused integrity check is not an error: it yields
    /// [`StartOutcome::Skipped`] and leaves the state at `NotStarted`.
    pub async fn start(
        &self,
        working_dir: Option<&Path>,
        args: &[String],
        output: OwnedFd,
    ) -> Result<StartOutcome, LaunchError> {
        if self.inner.start_attempted.swap(true, Ordering::SeqCst) {
            return Err(LaunchError::AlreadyStarted);
        }

        let guard = self.inner.guard.clone();
        let name = self.inner.script_name.clone();
        let checked = tokio::task::spawn_blocking(move || guard.check(&name))
            .await
            .map_err(|e| LaunchError::Join(e.to_string()))?;
        let script_path = match checked {
            Ok(path) => path,
            Err(err) => {
                warn!(
                    script_name = %self.inner.script_name,
                    error = %err,
                    "Script failed integrity check; skipping execution"
                );
                return Ok(StartOutcome::Skipped(err));
            }
        };

        let (mut command, program) = self.command(&script_path);
        let working_dir = working_dir.unwrap_or_else(|| self.inner.guard.root());
        let stderr = output.try_clone().map_err(LaunchError::Pipe)?;
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        let child = command
            .spawn()
            .map_err(|source| LaunchError::Spawn { program, source })?;
        // Close our copies of the pipe's write end.
        drop(command);
        let pid = child.id().ok_or(LaunchError::MissingPid)?;

        {
            let mut status = self.inner.status();
            status.state = ProcessState::Running;
            status.pid = Some(pid);
            status.started_at = Some(SystemTime::now());
        }
        info!(script_name = %self.inner.script_name, pid, "Script started");

        tokio::spawn(Arc::clone(&self.inner).watch(child, pid));
        Ok(StartOutcome::Started)
    }

    fn command(&self, script_path: &Path) -> (Command, String) {
        match &self.inner.options.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(script_path);
                (command, interpreter.clone())
            }
            None => (
                Command::new(script_path),
                script_path.display().to_string(),
            ),
        }
    }

    /// Terminate the process and wait until it is reaped.
    ///
    /// SIGTERM goes to the whole group first. If the process is still alive
    /// after the graceful timeout (cut short by `deadline`), the group gets
    /// SIGKILL. Only the first call signals; later or concurrent calls wait
    /// for the same completion. A process that never started is left alone.
    pub async fn stop(&self, deadline: Option<Instant>) -> Result<(), TerminationError> {
        let pid = {
            let status = self.inner.status();
            match (status.state, status.pid) {
                (ProcessState::Running, Some(pid)) => pid,
                _ => return Ok(()),
            }
        };

        let mut done = self.done();
        if self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            done.wait().await;
            return Ok(());
        }

        if let Err(err) = signal_group(pid, Signal::SIGTERM) {
            warn!(pid, error = %err, "Failed to deliver SIGTERM");
        }

        let graceful = self.inner.options.graceful_timeout;
        let wait = deadline.map_or(graceful, |d| {
            graceful.min(d.saturating_duration_since(Instant::now()))
        });
        if tokio::time::timeout(wait, done.wait()).await.is_ok() {
            return Ok(());
        }

        warn!(
            script_name = %self.inner.script_name,
            pid,
            timeout_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "Script did not exit after SIGTERM; sending SIGKILL"
        );
        self.inner.forced.store(true, Ordering::SeqCst);
        match signal_group(pid, Signal::SIGKILL) {
            Ok(_) => {
                done.wait().await;
                Ok(())
            }
            Err(err) => {
                error!(pid, error = %err, "Failed to deliver SIGKILL");
                let _ = tokio::time::timeout(graceful, done.wait()).await;
                Err(err)
            }
        }
    }

    /// SIGKILL whatever is left in the process group after the leader was
    /// reaped, so background children cannot hold the output pipe open.
    pub fn sweep_group(&self) -> Result<bool, TerminationError> {
        let Some(pid) = self.pid() else {
            return Ok(false);
        };
        if !self.state().is_terminal() {
            return Ok(false);
        }
        let swept = signal_group(pid, Signal::SIGKILL)?;
        if swept {
            debug!(pid, "Killed leftover processes in script group");
        }
        Ok(swept)
    }

    #[must_use]
    pub fn done(&self) -> DoneSignal {
        DoneSignal {
            rx: self.inner.done_tx.subscribe(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.inner.status().state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.status().pid
    }

    /// Exit code once terminal; `-1` when the process died from a signal.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.status().exit_code
    }

    #[must_use]
    pub fn started_at(&self) -> Option<SystemTime> {
        self.inner.status().started_at
    }

    #[must_use]
    pub fn script_name(&self) -> &str {
        &self.inner.script_name
    }

    #[must_use]
    pub fn graceful_timeout(&self) -> Duration {
        self.inner.options.graceful_timeout
    }
}
