// Monitor: owns the job registry and the two event queues
//
// Jobs push state and output events into unbounded queues; one consumer task
// per queue hands them to a `MonitorHandler`. A slow handler (network fan-out)
// therefore never stalls a job's own stop escalation.

use crate::supervisor::error::{SupervisorError, SupervisorResult};
use crate::supervisor::job::{Job, JobEvents, RunHandle, StopTimeouts};
use crate::supervisor::protocol::{CommandArgs, JobData, JobState, OutputEvent, StateChangedEvent};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often shutdown checks whether a `Starting` job has spawned
const SETTLE_POLL: Duration = Duration::from_millis(10);

/// How long shutdown waits for a job whose stop reported an error
const FAILED_STOP_GRACE: Duration = Duration::from_secs(1);

/// Receives the events drained from the monitor's queues
#[async_trait]
pub trait MonitorHandler: Send + Sync {
    async fn on_state_event(&self, event: StateChangedEvent) -> anyhow::Result<()>;

    async fn on_output_event(&self, event: OutputEvent) -> anyhow::Result<()>;
}

struct Queues {
    state_rx: UnboundedReceiver<StateChangedEvent>,
    output_rx: UnboundedReceiver<OutputEvent>,
}

pub struct Monitor {
    jobs: StdMutex<BTreeMap<String, Job>>,
    events: JobEvents,
    queues: StdMutex<Option<Queues>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    stop_timeouts: StopTimeouts,
    is_shut_down: Mutex<bool>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Monitor {
    pub fn new(stop_timeouts: StopTimeouts) -> Self {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        Self {
            jobs: StdMutex::new(BTreeMap::new()),
            events: JobEvents::new(state_tx, output_tx),
            queues: StdMutex::new(Some(Queues {
                state_rx,
                output_rx,
            })),
            consumers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            stop_timeouts,
            is_shut_down: Mutex::new(false),
        }
    }

    /// Spawn the two queue consumers, delivering to `handler`
    ///
    /// Can only be called once per monitor.
    pub async fn start(&self, handler: Arc<dyn MonitorHandler>) -> SupervisorResult<()> {
        let Queues {
            state_rx,
            output_rx,
        } = lock(&self.queues).take().ok_or(SupervisorError::AlreadyStarted)?;

        let state_handler = Arc::clone(&handler);
        let state_task = tokio::spawn(consume(
            "state",
            state_rx,
            self.cancel.clone(),
            move |event| {
                let handler = Arc::clone(&state_handler);
                async move { handler.on_state_event(event).await }
            },
        ));

        let output_task = tokio::spawn(consume(
            "output",
            output_rx,
            self.cancel.clone(),
            move |event| {
                let handler = Arc::clone(&handler);
                async move { handler.on_output_event(event).await }
            },
        ));

        self.consumers.lock().await.extend([state_task, output_task]);
        debug!("Monitor consumers started");
        Ok(())
    }

    /// Register a job, or reconfigure a known job that is not active
    pub fn add(
        &self,
        uid: &str,
        command: &str,
        as_process_group: bool,
        command_args: CommandArgs,
    ) -> SupervisorResult<JobData> {
        let mut jobs = lock(&self.jobs);

        if let Some(job) = jobs.get(uid) {
            if !job.update(command.to_string(), as_process_group, command_args) {
                return Err(SupervisorError::AlreadyRunning(uid.to_string()));
            }
            info!(%uid, "Reconfigured job");
            return Ok(job.data());
        }

        let data = JobData::new(uid.to_string(), command.to_string(), as_process_group)
            .with_command_args(command_args);
        let job = Job::new(data, self.events.clone());
        let data = job.data();
        jobs.insert(uid.to_string(), job);
        info!(%uid, "Registered new job");
        Ok(data)
    }

    /// Remove a job that is not active
    pub fn remove(&self, uid: &str) -> SupervisorResult<JobData> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get(uid)
            .ok_or_else(|| SupervisorError::UnknownJob(uid.to_string()))?;
        if job.is_active() {
            return Err(SupervisorError::AlreadyRunning(uid.to_string()));
        }

        let data = job.data();
        jobs.remove(uid);
        info!(%uid, "Removed job");
        Ok(data)
    }

    /// Start a job; the registry stays locked so a concurrent `remove` cannot orphan the run
    pub fn start_job(&self, uid: &str, overrides: CommandArgs) -> SupervisorResult<RunHandle> {
        lock(&self.jobs)
            .get(uid)
            .ok_or_else(|| SupervisorError::UnknownJob(uid.to_string()))?
            .start(overrides)
    }

    /// Stop a job; a start still in flight is waited out first
    pub async fn stop_job(&self, uid: &str) -> SupervisorResult<i32> {
        let job = self.get(uid)?;
        wait_until_spawned(&job).await;
        job.stop(self.stop_timeouts).await
    }

    /// Stop the job if it is active, then start it again
    pub async fn restart_job(&self, uid: &str, ignore_stop_failure: bool) -> SupervisorResult<RunHandle> {
        let job = self.get(uid)?;

        if job.is_active() {
            wait_until_spawned(&job).await;
            if let Err(err) = job.stop(self.stop_timeouts).await {
                if !ignore_stop_failure {
                    return Err(SupervisorError::RestartStopFailed {
                        uid: uid.to_string(),
                        reason: err.to_string(),
                    });
                }
                debug!(%uid, "Ignoring failed stop before restart: {}", err);
            }
            if let Some(run) = job.run_handle() {
                run.wait().await;
            }
        }

        job.restart(CommandArgs::new())
    }

    /// Snapshot of one job
    pub fn job(&self, uid: &str) -> Option<JobData> {
        lock(&self.jobs).get(uid).map(Job::data)
    }

    /// Snapshot of every job, ordered by uid
    pub fn jobs(&self) -> Vec<JobData> {
        lock(&self.jobs).values().map(Job::data).collect()
    }

    fn get(&self, uid: &str) -> SupervisorResult<Job> {
        lock(&self.jobs)
            .get(uid)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownJob(uid.to_string()))
    }

    /// Stop every active job, then let the consumers drain and exit
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        let mut is_shut_down = self.is_shut_down.lock().await;
        if *is_shut_down {
            debug!("Monitor already shut down");
            return;
        }

        let active: Vec<Job> = lock(&self.jobs)
            .values()
            .filter(|job| job.is_active())
            .cloned()
            .collect();
        info!("Initiating monitor shutdown, stopping {} running jobs", active.len());

        for job in active {
            let uid = job.uid();
            info!(%uid, "Stopping job");
            wait_until_spawned(&job).await;

            let stopped = job.stop(self.stop_timeouts).await;
            let Some(run) = job.run_handle() else {
                continue;
            };
            match stopped {
                Ok(_) => {
                    run.wait().await;
                }
                Err(err) => {
                    warn!(%uid, "Failed to stop job during shutdown: {}", err);
                    if tokio::time::timeout(FAILED_STOP_GRACE, run.wait()).await.is_err() {
                        warn!(%uid, "Job did not end during shutdown");
                    }
                }
            }
        }

        self.cancel.cancel();
        for consumer in self.consumers.lock().await.drain(..) {
            if let Err(err) = consumer.await {
                warn!("Monitor consumer failed: {}", err);
            }
        }

        *is_shut_down = true;
        info!("Monitor shutdown complete, all jobs stopped");
    }
}

/// A start in flight cannot be stopped yet; wait until the process exists
async fn wait_until_spawned(job: &Job) {
    while job.state() == JobState::Starting {
        tokio::time::sleep(SETTLE_POLL).await;
    }
}

async fn consume<T, F, Fut>(
    queue: &'static str,
    mut rx: UnboundedReceiver<T>,
    cancel: CancellationToken,
    mut deliver: F,
) where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = cancel.cancelled() => break,
        };
        let Some(event) = event else {
            break;
        };
        if let Err(err) = deliver(event).await {
            warn!(queue, "Event handler failed: {:#}", err);
        }
    }

    // Deliver what was queued before cancellation
    while let Ok(event) = rx.try_recv() {
        if let Err(err) = deliver(event).await {
            warn!(queue, "Event handler failed: {:#}", err);
        }
    }
    debug!(queue, "Monitor consumer exited");
}
