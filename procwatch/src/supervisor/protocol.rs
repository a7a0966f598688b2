// Supervisor protocol - shared structs for daemon <-> client communication
// Every frame is one JSON document: `{"type": <name>, "data": <payload>}` from the
// server, `{"action": <name>, "data": {...}}` from clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Maximum accepted size of a single client request frame (1MB)
pub const MAX_REQUEST_FRAME_SIZE: usize = 1024 * 1024;

/// Action name used when a frame could not be parsed at all
pub const INVALID_ACTION: &str = "invalid";

/// Named placeholder values substituted into a job's command at start time
pub type CommandArgs = HashMap<String, Value>;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Registered (or reset) and ready to start
    Initialized,
    /// Start accepted, process is being spawned
    Starting,
    /// Process is alive and its output is being drained
    Started,
    /// Escalating termination is in progress
    Stopping,
    /// Process has exited and its exit code is recorded
    Ended,
}

impl JobState {
    /// True while a process is (about to be) alive
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Starting | JobState::Started | JobState::Stopping
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Initialized => write!(f, "initialized"),
            JobState::Starting => write!(f, "starting"),
            JobState::Started => write!(f, "started"),
            JobState::Stopping => write!(f, "stopping"),
            JobState::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(JobState::Initialized),
            "starting" => Ok(JobState::Starting),
            "started" => Ok(JobState::Started),
            "stopping" => Ok(JobState::Stopping),
            "ended" => Ok(JobState::Ended),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// Description of one supervised job, exchanged via protocol
///
/// Equality and hashing only consider `uid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    /// Unique, immutable job key
    pub uid: String,
    /// Shell command, may contain `{key}` placeholders
    pub command: String,
    /// Spawn in a new process group and signal the whole group
    pub as_process_group: bool,
    /// Default placeholder values for `command`
    #[serde(default)]
    pub command_args: CommandArgs,
    /// Current lifecycle state
    pub state: JobState,
    /// Exit code, set if and only if the job has ended
    pub exit_code: Option<i32>,
    /// PID of the running process
    #[serde(default)]
    pub pid: Option<u32>,
    /// When the state last changed
    pub updated_at: DateTime<Utc>,
}

impl JobData {
    pub fn new(uid: String, command: String, as_process_group: bool) -> Self {
        Self {
            uid,
            command,
            as_process_group,
            command_args: CommandArgs::new(),
            state: JobState::Initialized,
            exit_code: None,
            pid: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_command_args(mut self, command_args: CommandArgs) -> Self {
        self.command_args = command_args;
        self
    }

    /// Return to `Initialized`, forgetting the previous run
    pub fn reset(&mut self) {
        self.set_state(JobState::Initialized);
        self.exit_code = None;
        self.pid = None;
    }

    pub fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Record the final exit code together with the `Ended` state
    pub fn finish(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
        self.pid = None;
        self.set_state(JobState::Ended);
    }
}

impl PartialEq for JobData {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for JobData {}

impl Hash for JobData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

// ============================================================================
// Events
// ============================================================================

/// A job changed its lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedEvent {
    pub uid: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
}

/// A chunk of stdout/stderr output produced by a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub uid: String,
    pub output: String,
}

/// Reply to a single client action
///
/// A failed action is still an `ActionResponse`, with `success == false` and the
/// error message as `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub uid: Option<String>,
    pub action: String,
    pub success: bool,
    pub data: Value,
}

impl ActionResponse {
    pub fn ok(uid: Option<String>, action: impl Into<String>, data: Value) -> Self {
        Self {
            uid,
            action: action.into(),
            success: true,
            data,
        }
    }

    /// Build an `ActionFailure`
    pub fn failure(uid: Option<String>, action: impl Into<String>, message: impl ToString) -> Self {
        Self {
            uid,
            action: action.into(),
            success: false,
            data: Value::String(message.to_string()),
        }
    }

    /// Failure message, if this response is an `ActionFailure`
    pub fn error_message(&self) -> Option<&str> {
        if self.success {
            None
        } else {
            self.data.as_str()
        }
    }
}

// ============================================================================
// Server -> client frames
// ============================================================================

/// Every frame the server sends, unicast or broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Reply to the connection that issued an action
    ActionResponse(ActionResponse),
    /// Full job list, sent on connect and periodically
    ProcessSummaryEvent(Vec<JobData>),
    /// A job changed state
    StateChangedEvent(StateChangedEvent),
    /// Coalesced output of one job
    OutputEvent(OutputEvent),
}

// ============================================================================
// Client -> server requests
// ============================================================================

/// Action request from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a frame to its JSON text
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Deserialize a frame from JSON text (tolerates a trailing newline)
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(text.trim_end_matches('\n'))
}
