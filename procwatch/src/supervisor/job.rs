// Job runtime: one supervised shell command and its lifecycle
//
// Provides the state machine around a child process:
// - Spawning via `/bin/sh -c`, optionally in its own process group
// - Draining stdout/stderr line by line into the output queue
// - Escalating termination (SIGINT -> SIGTERM -> SIGKILL)
// - Exit code capture and restart from `Ended`

use crate::supervisor::command::resolve_command;
use crate::supervisor::error::{SupervisorError, SupervisorResult};
use crate::supervisor::protocol::{CommandArgs, JobData, JobState, OutputEvent, StateChangedEvent};
use crate::supervisor::signals::{exit_code_of, is_process_gone, Signal, SignalTarget};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Default grace period after SIGINT before escalating
pub const DEFAULT_INT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default grace period after SIGTERM before escalating
pub const DEFAULT_TERM_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest single sleep while waiting out an escalation stage
const POLL_SLICE: Duration = Duration::from_millis(500);

/// Delay before the first exit check after SIGINT
const FIRST_CHECK_DELAY: Duration = Duration::from_millis(10);

/// Poll cadence once SIGKILL was sent
const KILL_POLL: Duration = Duration::from_millis(100);

/// How long output draining may continue once the child was reaped
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How long to wait for the exit code when signalling finds no process
const GONE_GRACE: Duration = Duration::from_secs(1);

const SHELL: &str = "/bin/sh";

/// Budgets for the first two escalation stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTimeouts {
    pub interrupt: Duration,
    pub terminate: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            interrupt: DEFAULT_INT_TIMEOUT,
            terminate: DEFAULT_TERM_TIMEOUT,
        }
    }
}

/// Queues a job reports into, handed over at construction
#[derive(Debug, Clone)]
pub struct JobEvents {
    state_tx: mpsc::UnboundedSender<StateChangedEvent>,
    output_tx: mpsc::UnboundedSender<OutputEvent>,
}

impl JobEvents {
    pub fn new(
        state_tx: mpsc::UnboundedSender<StateChangedEvent>,
        output_tx: mpsc::UnboundedSender<OutputEvent>,
    ) -> Self {
        Self {
            state_tx,
            output_tx,
        }
    }

    /// Sends are non-blocking; a closed queue only means nobody is listening anymore
    fn state(&self, data: &JobData) {
        let _ = self.state_tx.send(StateChangedEvent {
            uid: data.uid.clone(),
            state: data.state,
            exit_code: data.exit_code,
        });
    }

    fn output(&self, uid: &str, output: String) {
        let _ = self.output_tx.send(OutputEvent {
            uid: uid.to_string(),
            output,
        });
    }
}

/// Awaitable result of one run of a job
#[derive(Debug, Clone)]
pub struct RunHandle {
    exit_rx: watch::Receiver<Option<i32>>,
}

impl RunHandle {
    /// Exit code, if the run already finished
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Wait until the run finished and return its exit code
    pub async fn wait(mut self) -> i32 {
        loop {
            if let Some(code) = *self.exit_rx.borrow_and_update() {
                return code;
            }
            if self.exit_rx.changed().await.is_err() {
                return self.exit_rx.borrow().unwrap_or(-1);
            }
        }
    }
}

/// Per-run control shared between the job and its run task
#[derive(Default)]
struct RunSlot {
    exit_rx: Option<watch::Receiver<Option<i32>>>,
    /// Tells the run task to kill the child and stop draining
    kill: Option<Arc<Notify>>,
}

struct JobInner {
    data: StdMutex<JobData>,
    run: StdMutex<RunSlot>,
    events: JobEvents,
}

/// Handle to a supervised job
///
/// Cloning is cheap; all clones observe and drive the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Job {
    pub fn new(data: JobData, events: JobEvents) -> Self {
        Self {
            inner: Arc::new(JobInner {
                data: StdMutex::new(data),
                run: StdMutex::new(RunSlot::default()),
                events,
            }),
        }
    }

    pub fn uid(&self) -> String {
        lock(&self.inner.data).uid.clone()
    }

    /// Snapshot of the job's current data
    pub fn data(&self) -> JobData {
        lock(&self.inner.data).clone()
    }

    pub fn state(&self) -> JobState {
        lock(&self.inner.data).state
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.inner.data).exit_code
    }

    pub fn has_exit_code(&self) -> bool {
        self.exit_code().is_some()
    }

    /// True while the process is alive and not yet being stopped
    pub fn is_running(&self) -> bool {
        self.state() == JobState::Started
    }

    /// True from the moment a start is accepted until the exit code is recorded
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Handle to the current (or last) run, if the job was ever started
    pub fn run_handle(&self) -> Option<RunHandle> {
        lock(&self.inner.run)
            .exit_rx
            .clone()
            .map(|exit_rx| RunHandle { exit_rx })
    }

    /// Replace command, group flag and default args
    ///
    /// Only allowed while `Initialized` or `Ended`; the job is fully reset and
    /// an `initialized` event is emitted. Returns false (and changes nothing)
    /// while the job is active.
    pub fn update(&self, command: String, as_process_group: bool, command_args: CommandArgs) -> bool {
        let mut data = lock(&self.inner.data);
        if data.state.is_active() {
            warn!(uid = %data.uid, state = %data.state, "Cannot change job data while it is active");
            return false;
        }

        data.command = command;
        data.as_process_group = as_process_group;
        data.command_args = command_args;
        data.reset();
        self.inner.events.state(&data);
        true
    }

    /// Start the job, resolving placeholders from its args merged with `overrides`
    ///
    /// Legal from `Initialized` or `Ended` (which is reset first). The state moves
    /// to `Starting` before this returns, so concurrent starts are rejected.
    pub fn start(&self, overrides: CommandArgs) -> SupervisorResult<RunHandle> {
        let (uid, command, as_process_group) = {
            let mut data = lock(&self.inner.data);
            match data.state {
                JobState::Initialized => {}
                JobState::Ended => {
                    info!(uid = %data.uid, "Restarting ended job");
                    data.reset();
                    self.inner.events.state(&data);
                }
                state => {
                    warn!(uid = %data.uid, %state, "Job cannot be started");
                    return Err(SupervisorError::InvalidState {
                        uid: data.uid.clone(),
                        operation: "started",
                        state,
                    });
                }
            }

            data.set_state(JobState::Starting);
            self.inner.events.state(&data);

            let command = resolve_command(&data.command, &data.command_args, &overrides)
                .unwrap_or_else(|err| {
                    warn!(uid = %data.uid, "Using unresolved command: {}", err);
                    data.command.clone()
                });
            (data.uid.clone(), command, data.as_process_group)
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        {
            let mut run = lock(&self.inner.run);
            run.exit_rx = Some(exit_rx.clone());
            run.kill = Some(Arc::clone(&kill));
        }

        let guard = RunGuard {
            inner: Arc::clone(&self.inner),
            exit_tx,
            finished: false,
        };
        tokio::spawn(run_process(guard, uid, command, as_process_group, kill));

        Ok(RunHandle { exit_rx })
    }

    /// Start again after the previous run ended
    pub fn restart(&self, overrides: CommandArgs) -> SupervisorResult<RunHandle> {
        {
            let data = lock(&self.inner.data);
            if data.state != JobState::Ended {
                warn!(uid = %data.uid, state = %data.state, "Job cannot be restarted");
                return Err(SupervisorError::InvalidState {
                    uid: data.uid.clone(),
                    operation: "restarted",
                    state: data.state,
                });
            }
        }
        self.start(overrides)
    }

    /// Stop the process, escalating SIGINT -> SIGTERM -> SIGKILL
    ///
    /// Returns the recorded exit code. A job that is already being stopped is
    /// not signalled again; the caller waits for the running escalation instead.
    pub async fn stop(&self, timeouts: StopTimeouts) -> SupervisorResult<i32> {
        let (uid, pid, as_process_group, already_stopping) = {
            let mut data = lock(&self.inner.data);
            let state = data.state;
            match state {
                JobState::Started => {
                    data.set_state(JobState::Stopping);
                    self.inner.events.state(&data);
                    (data.uid.clone(), data.pid, data.as_process_group, false)
                }
                JobState::Stopping => (data.uid.clone(), data.pid, data.as_process_group, true),
                _ => {
                    warn!(uid = %data.uid, %state, "Job is not running, cannot stop");
                    return Err(SupervisorError::NotRunning(data.uid.clone()));
                }
            }
        };

        if already_stopping {
            debug!(%uid, "Stop already in progress, waiting for exit");
            return Ok(self.wait_for_exit_code().await);
        }

        let result = match pid {
            Some(pid) => {
                debug!(%uid, pid, "Stopping...");
                self.escalate(&uid, pid, as_process_group, timeouts).await
            }
            None => Err(SupervisorError::ProcessGone(uid.clone())),
        };

        match result {
            Err(SupervisorError::ProcessGone(uid)) => {
                // Already reaped but the run task has not recorded the exit yet
                match self.poll_exit_code(GONE_GRACE, KILL_POLL).await {
                    Some(code) => Ok(code),
                    None => {
                        warn!(%uid, "Failed to find process, it is no longer running");
                        Err(SupervisorError::ProcessGone(uid))
                    }
                }
            }
            other => other,
        }
    }

    async fn escalate(
        &self,
        uid: &str,
        pid: u32,
        as_process_group: bool,
        timeouts: StopTimeouts,
    ) -> SupervisorResult<i32> {
        let target = SignalTarget::resolve(pid, as_process_group)
            .map_err(|err| signal_error(uid, err))?;

        self.signal(uid, target, Signal::Interrupt)?;
        tokio::time::sleep(FIRST_CHECK_DELAY).await;
        if let Some(code) = self.exit_code() {
            return Ok(code);
        }
        if let Some(code) = self.poll_exit_code(timeouts.interrupt, POLL_SLICE).await {
            return Ok(code);
        }

        debug!(%uid, "Stopping, escalating to SIGTERM");
        self.signal(uid, target, Signal::Terminate)?;
        if let Some(code) = self.poll_exit_code(timeouts.terminate, POLL_SLICE).await {
            return Ok(code);
        }

        debug!(%uid, "Stopping, escalating to SIGKILL");
        if let Err(err) = target.send(Signal::Kill) {
            debug!(%uid, "SIGKILL failed: {}", err);
        }
        if let Some(kill) = lock(&self.inner.run).kill.as_ref() {
            kill.notify_one();
        }

        debug!(%uid, "Waiting for exit code");
        Ok(self.wait_for_exit_code().await)
    }

    /// Send one signal; only a vanished process aborts the escalation
    fn signal(&self, uid: &str, target: SignalTarget, signal: Signal) -> SupervisorResult<()> {
        match target.send(signal) {
            Ok(()) => Ok(()),
            Err(err) if is_process_gone(&err) => Err(SupervisorError::ProcessGone(uid.to_string())),
            Err(err) => {
                warn!(%uid, %signal, "Exception stopping process: {}", err);
                Ok(())
            }
        }
    }

    /// Sleep in slices of at most `slice` for up to `budget`, checking for an exit code
    async fn poll_exit_code(&self, budget: Duration, slice: Duration) -> Option<i32> {
        let mut remaining = budget;
        while !remaining.is_zero() {
            let step = remaining.min(slice);
            tokio::time::sleep(step).await;
            remaining -= step;

            if let Some(code) = self.exit_code() {
                return Some(code);
            }
        }
        None
    }

    async fn wait_for_exit_code(&self) -> i32 {
        loop {
            if let Some(code) = self.exit_code() {
                return code;
            }
            tokio::time::sleep(KILL_POLL).await;
        }
    }
}

fn signal_error(uid: &str, err: std::io::Error) -> SupervisorError {
    if is_process_gone(&err) {
        SupervisorError::ProcessGone(uid.to_string())
    } else {
        SupervisorError::Signal {
            uid: uid.to_string(),
            message: err.to_string(),
        }
    }
}

/// Records the end of a run exactly once, even if the run task is cancelled
struct RunGuard {
    inner: Arc<JobInner>,
    exit_tx: watch::Sender<Option<i32>>,
    finished: bool,
}

impl RunGuard {
    fn finish(&mut self, exit_code: i32) {
        if self.finished {
            return;
        }
        self.finished = true;

        {
            let mut data = lock(&self.inner.data);
            data.finish(exit_code);
            debug!(uid = %data.uid, exit_code, "Job has exited");
            self.inner.events.state(&data);
        }
        self.exit_tx.send_replace(Some(exit_code));
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Run cancelled before an exit code was captured");
            self.finish(-1);
        }
    }
}

async fn run_process(
    mut guard: RunGuard,
    uid: String,
    command: String,
    as_process_group: bool,
    kill: Arc<Notify>,
) {
    debug!(%uid, %command, "Starting command");

    let mut std_command = std::process::Command::new(SHELL);
    std_command
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if as_process_group {
        use std::os::unix::process::CommandExt;
        std_command.process_group(0);
    }
    let mut child = match Command::from(std_command).kill_on_drop(true).spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(%uid, "Failed to start process: {}", err);
            guard.inner.events.output(&uid, format!("{}\n", err));
            guard.finish(-1);
            return;
        }
    };

    let mut drain = tokio::spawn(drain_output(
        uid.clone(),
        child.stdout.take(),
        child.stderr.take(),
        guard.inner.events.clone(),
    ));

    {
        let mut data = lock(&guard.inner.data);
        data.pid = child.id();
        data.set_state(JobState::Started);
        debug!(%uid, pid = ?data.pid, "Running");
        guard.inner.events.state(&data);
    }

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.notified() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            debug!(%uid, "Killing process handle and cancelling output");
            if let Err(err) = child.start_kill() {
                debug!(%uid, "Process handle kill failed: {}", err);
            }
            drain.abort();
            child.wait().await
        }
    };

    if !drain.is_finished()
        && tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err()
    {
        debug!(%uid, "Output still open after exit, abandoning it");
        drain.abort();
    }

    let exit_code = match status {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            warn!(%uid, "Failed to wait for process: {}", err);
            -1
        }
    };
    guard.finish(exit_code);
}

async fn drain_output(
    uid: String,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    events: JobEvents,
) {
    tokio::join!(
        forward_lines(&uid, stdout, &events),
        forward_lines(&uid, stderr, &events)
    );
}

async fn forward_lines<R: AsyncRead + Unpin>(uid: &str, stream: Option<R>, events: &JobEvents) {
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => events.output(uid, String::from_utf8_lossy(&line).into_owned()),
            Err(err) => {
                debug!(%uid, "Output read error: {}", err);
                break;
            }
        }
    }
}
