// JobControlService: the monitor exposed through the action server
//
// Registers the job actions, broadcasts state events as they arrive,
// coalesces output per job and pushes a full job summary whenever an action
// changed something (or at least once per summary interval).

use crate::supervisor::action_server::{Action, ActionServer, WelcomeHook};
use crate::supervisor::config::{Config, JobSpec};
use crate::supervisor::error::SupervisorResult;
use crate::supervisor::monitor::{Monitor, MonitorHandler};
use crate::supervisor::protocol::{
    ActionResponse, CommandArgs, JobData, OutputEvent, ServerMessage, StateChangedEvent,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct JobControlService {
    monitor: Arc<Monitor>,
    server: Arc<ActionServer>,
    /// Set by every successful mutating action
    summary_dirty: Arc<Notify>,
    output: Arc<OutputCoalescer>,
    summary_interval: Duration,
    output_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobControlService {
    pub fn new(config: &Config) -> Self {
        let service = Self {
            monitor: Arc::new(Monitor::new(config.stop_timeouts)),
            server: Arc::new(ActionServer::new()),
            summary_dirty: Arc::new(Notify::new()),
            output: Arc::new(OutputCoalescer::default()),
            summary_interval: config.summary_interval,
            output_interval: config.output_interval,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        service.register_actions();
        service.server.set_welcome_hook(Arc::new(SummaryWelcome {
            monitor: Arc::clone(&service.monitor),
        }));
        service
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn server(&self) -> &Arc<ActionServer> {
        &self.server
    }

    fn register_actions(&self) {
        let ctx = ActionContext {
            monitor: Arc::clone(&self.monitor),
            summary_dirty: Arc::clone(&self.summary_dirty),
        };

        let actions = [
            action(&ctx, "add", &["uid", "cmd", "group"], add_job)
                .with_default("commandArgs", json!({})),
            action(&ctx, "remove", &["uid"], remove_job),
            action(&ctx, "start", &["uid"], start_job).with_default("commandArgs", json!({})),
            action(&ctx, "restart", &["uid"], restart_job)
                .with_default("ignoreStopFailure", json!(false)),
            action(&ctx, "stop", &["uid"], stop_job),
            action(&ctx, "list", &[], list_jobs),
        ];
        for action in actions {
            self.server.add_action(action);
        }
    }

    /// Start the consumers, the periodic broadcasts and the listener
    pub async fn start(&self, listener: TcpListener) -> Result<()> {
        let broadcaster = Arc::new(Broadcaster {
            server: Arc::clone(&self.server),
            output: Arc::clone(&self.output),
        });
        self.monitor.start(broadcaster).await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(summary_loop(
            Arc::clone(&self.monitor),
            Arc::clone(&self.server),
            Arc::clone(&self.summary_dirty),
            self.summary_interval,
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(output_loop(
            Arc::clone(&self.server),
            Arc::clone(&self.output),
            self.output_interval,
            self.cancel.clone(),
        )));

        let server = Arc::clone(&self.server);
        tasks.push(tokio::spawn(async move {
            if let Err(err) = server.run(listener).await {
                warn!("Action server failed: {:#}", err);
            }
        }));

        info!("Job control service started");
        Ok(())
    }

    /// Register the initial jobs and schedule their auto-starts
    pub async fn seed_jobs(&self, specs: Vec<JobSpec>) -> SupervisorResult<()> {
        for spec in specs {
            self.monitor
                .add(&spec.uid, &spec.cmd, spec.group, spec.command_args)?;

            let Some(delay) = spec.auto_start.delay() else {
                continue;
            };
            if delay.is_zero() {
                self.monitor.start_job(&spec.uid, CommandArgs::new())?;
                continue;
            }

            info!(uid = %spec.uid, ?delay, "Scheduling delayed start");
            let monitor = Arc::clone(&self.monitor);
            let summary_dirty = Arc::clone(&self.summary_dirty);
            let cancel = self.cancel.clone();
            let uid = spec.uid;
            self.tasks.lock().await.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        match monitor.start_job(&uid, CommandArgs::new()) {
                            Ok(_) => summary_dirty.notify_one(),
                            Err(err) => warn!(%uid, "Delayed start failed: {}", err),
                        }
                    }
                }
            }));
        }

        self.summary_dirty.notify_one();
        Ok(())
    }

    /// Stop every job, flush pending output, then close all connections
    pub async fn shutdown(&self) {
        info!("Shutdown initiated");
        self.monitor.shutdown().await;
        self.server
            .broadcast(&ServerMessage::ProcessSummaryEvent(self.monitor.jobs()));

        self.cancel.cancel();
        self.server.shutdown();
        for task in self.tasks.lock().await.drain(..) {
            if let Err(err) = task.await {
                warn!("Service task failed: {}", err);
            }
        }
        info!("Shutdown complete");
    }
}

#[derive(Clone)]
struct ActionContext {
    monitor: Arc<Monitor>,
    summary_dirty: Arc<Notify>,
}

impl ActionContext {
    /// Map a monitor result to a response, flagging the summary as stale on success
    fn respond<T>(
        &self,
        uid: &str,
        action: &str,
        result: SupervisorResult<T>,
        data: impl FnOnce(T) -> Value,
    ) -> ActionResponse {
        match result {
            Ok(value) => {
                self.summary_dirty.notify_one();
                ActionResponse::ok(Some(uid.to_string()), action, data(value))
            }
            Err(err) => ActionResponse::failure(Some(uid.to_string()), action, err),
        }
    }

    fn job_value(&self, uid: &str) -> Value {
        self.monitor
            .job(uid)
            .map(|job| job_to_value(&job))
            .unwrap_or(Value::Null)
    }
}

fn action<F, Fut>(ctx: &ActionContext, name: &'static str, keys: &[&str], handler: F) -> Action
where
    F: Fn(ActionContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ActionResponse> + Send + 'static,
{
    let ctx = ctx.clone();
    Action::new(name, keys, move |values| handler(ctx.clone(), values))
}

fn job_to_value(job: &JobData) -> Value {
    serde_json::to_value(job).unwrap_or(Value::Null)
}

/// Typed view of one positional action value
fn arg<T: serde::de::DeserializeOwned>(values: &[Value], index: usize, key: &str) -> Result<T, String> {
    let value = values.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|err| format!("invalid value for '{}': {}", key, err))
}

async fn add_job(ctx: ActionContext, values: Vec<Value>) -> ActionResponse {
    let uid = values.first().and_then(Value::as_str).map(str::to_string);
    let parsed = (|| -> Result<(String, String, bool, CommandArgs), String> {
        Ok((
            arg(&values, 0, "uid")?,
            arg(&values, 1, "cmd")?,
            arg(&values, 2, "group")?,
            arg(&values, 3, "commandArgs")?,
        ))
    })();
    let (uid, cmd, group, command_args) = match parsed {
        Ok(parsed) => parsed,
        Err(message) => return ActionResponse::failure(uid, "add", message),
    };

    let result = ctx.monitor.add(&uid, &cmd, group, command_args);
    ctx.respond(&uid, "add", result, |job| job_to_value(&job))
}

async fn remove_job(ctx: ActionContext, values: Vec<Value>) -> ActionResponse {
    let uid: String = match arg(&values, 0, "uid") {
        Ok(uid) => uid,
        Err(message) => return ActionResponse::failure(None, "remove", message),
    };

    let result = ctx.monitor.remove(&uid);
    ctx.respond(&uid, "remove", result, |job| job_to_value(&job))
}

async fn start_job(ctx: ActionContext, values: Vec<Value>) -> ActionResponse {
    let uid: String = match arg(&values, 0, "uid") {
        Ok(uid) => uid,
        Err(message) => return ActionResponse::failure(None, "start", message),
    };
    let overrides: CommandArgs = match arg(&values, 1, "commandArgs") {
        Ok(overrides) => overrides,
        Err(message) => return ActionResponse::failure(Some(uid), "start", message),
    };

    let result = ctx.monitor.start_job(&uid, overrides);
    ctx.respond(&uid, "start", result, |_| ctx.job_value(&uid))
}

async fn restart_job(ctx: ActionContext, values: Vec<Value>) -> ActionResponse {
    let uid: String = match arg(&values, 0, "uid") {
        Ok(uid) => uid,
        Err(message) => return ActionResponse::failure(None, "restart", message),
    };
    let ignore_stop_failure: bool = match arg(&values, 1, "ignoreStopFailure") {
        Ok(ignore) => ignore,
        Err(message) => return ActionResponse::failure(Some(uid), "restart", message),
    };

    let result = ctx.monitor.restart_job(&uid, ignore_stop_failure).await;
    ctx.respond(&uid, "restart", result, |_| ctx.job_value(&uid))
}

async fn stop_job(ctx: ActionContext, values: Vec<Value>) -> ActionResponse {
    let uid: String = match arg(&values, 0, "uid") {
        Ok(uid) => uid,
        Err(message) => return ActionResponse::failure(None, "stop", message),
    };

    let result = ctx.monitor.stop_job(&uid).await;
    ctx.respond(&uid, "stop", result, |code| json!(code))
}

async fn list_jobs(ctx: ActionContext, _values: Vec<Value>) -> ActionResponse {
    let jobs = ctx.monitor.jobs();
    ActionResponse::ok(None, "list", serde_json::to_value(jobs).unwrap_or(Value::Null))
}

/// Unicasts the current job list to every new connection
struct SummaryWelcome {
    monitor: Arc<Monitor>,
}

#[async_trait]
impl WelcomeHook for SummaryWelcome {
    async fn welcome(&self) -> Vec<ServerMessage> {
        vec![ServerMessage::ProcessSummaryEvent(self.monitor.jobs())]
    }
}

/// Monitor handler: state events go out immediately, output is coalesced
struct Broadcaster {
    server: Arc<ActionServer>,
    output: Arc<OutputCoalescer>,
}

#[async_trait]
impl MonitorHandler for Broadcaster {
    async fn on_state_event(&self, event: StateChangedEvent) -> Result<()> {
        debug!(uid = %event.uid, state = %event.state, "Broadcasting state event");
        self.server.broadcast(&ServerMessage::StateChangedEvent(event));
        Ok(())
    }

    async fn on_output_event(&self, event: OutputEvent) -> Result<()> {
        self.output.push(event);
        Ok(())
    }
}

/// Output accumulated per uid until the next flush
#[derive(Default)]
struct OutputCoalescer {
    pending: StdMutex<BTreeMap<String, String>>,
    arrived: Notify,
}

impl OutputCoalescer {
    fn push(&self, event: OutputEvent) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.uid)
            .or_default()
            .push_str(&event.output);
        self.arrived.notify_one();
    }

    fn take(&self) -> Vec<OutputEvent> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
            .into_iter()
            .map(|(uid, output)| OutputEvent { uid, output })
            .collect()
    }
}

async fn output_loop(
    server: Arc<ActionServer>,
    output: Arc<OutputCoalescer>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = output.arrived.notified() => {}
        }
        // Let the rest of this interval's output accumulate
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        for event in output.take() {
            server.broadcast(&ServerMessage::OutputEvent(event));
        }
    }

    for event in output.take() {
        server.broadcast(&ServerMessage::OutputEvent(event));
    }
    debug!("Output loop exited");
}

async fn summary_loop(
    monitor: Arc<Monitor>,
    server: Arc<ActionServer>,
    dirty: Arc<Notify>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = dirty.notified() => debug!("Job list changed"),
            _ = tokio::time::sleep(interval) => debug!("Periodic update"),
        }
        server.broadcast(&ServerMessage::ProcessSummaryEvent(monitor.jobs()));
    }
    debug!("Summary loop exited");
}
