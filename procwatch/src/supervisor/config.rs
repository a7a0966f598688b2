// Environment configuration for the daemon and the CLI
// Handles the listen address, timing knobs, the state directory and the
// initial job list file.

use crate::supervisor::job::StopTimeouts;
use crate::supervisor::protocol::CommandArgs;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8766;
pub const DEFAULT_SUMMARY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_OUTPUT_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for the daemon's address, paths and timings
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory holding the PID file and the default job list
    pub state_dir: PathBuf,
    /// Initial job list, loaded at boot
    pub jobs_file: Option<PathBuf>,
    /// Longest time between two `ProcessSummaryEvent` broadcasts
    pub summary_interval: Duration,
    /// Window in which output of one job is coalesced
    pub output_interval: Duration,
    pub stop_timeouts: StopTimeouts,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = Self::default_state_dir();
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            jobs_file: Self::existing_jobs_file(&state_dir),
            state_dir,
            summary_interval: DEFAULT_SUMMARY_INTERVAL,
            output_interval: DEFAULT_OUTPUT_INTERVAL,
            stop_timeouts: StopTimeouts::default(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // PROCWATCH_DIR moves the whole state directory
        if let Some(dir) = lookup("PROCWATCH_DIR") {
            config.state_dir = PathBuf::from(dir);
            config.jobs_file = Self::existing_jobs_file(&config.state_dir);
        }
        if let Some(host) = lookup("PROCWATCH_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "PROCWATCH_PORT") {
            config.port = port;
        }
        if let Some(jobs) = lookup("PROCWATCH_JOBS") {
            config.jobs_file = Some(PathBuf::from(jobs));
        }
        if let Some(secs) = parse_var(&lookup, "PROCWATCH_SUMMARY_SECS") {
            config.summary_interval = Duration::from_secs(secs);
        }
        if let Some(millis) = parse_var(&lookup, "PROCWATCH_OUTPUT_MS") {
            config.output_interval = Duration::from_millis(millis);
        }

        config
    }

    /// `~/.procwatch/` (or /tmp/procwatch if home unavailable)
    fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".procwatch"))
            .unwrap_or_else(|| PathBuf::from("/tmp/procwatch"))
    }

    fn existing_jobs_file(state_dir: &Path) -> Option<PathBuf> {
        Some(state_dir.join("jobs.json")).filter(|path| path.exists())
    }

    /// `ws://host:port` address clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("daemon.pid")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)
    }

    /// Write the daemon PID to the PID file
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(self.pid_file(), std::process::id().to_string())
    }

    /// Read the daemon PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.pid_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn remove_pid(&self) -> std::io::Result<()> {
        let pid_file = self.pid_file();
        if pid_file.exists() {
            std::fs::remove_file(pid_file)
        } else {
            Ok(())
        }
    }

    /// Jobs from `jobs_file`, or none when no file is configured
    pub fn load_jobs(&self) -> Result<Vec<JobSpec>> {
        match &self.jobs_file {
            Some(path) => load_jobs(path),
            None => Ok(Vec::new()),
        }
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

/// When a job from the initial list is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AutoStart {
    Enabled(bool),
    /// Start after this many seconds
    Delay(u64),
}

impl Default for AutoStart {
    fn default() -> Self {
        AutoStart::Enabled(false)
    }
}

impl AutoStart {
    pub fn delay(self) -> Option<Duration> {
        match self {
            AutoStart::Enabled(true) => Some(Duration::ZERO),
            AutoStart::Enabled(false) => None,
            AutoStart::Delay(secs) => Some(Duration::from_secs(secs)),
        }
    }
}

/// One entry of the initial job list
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub uid: String,
    pub cmd: String,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub auto_start: AutoStart,
    #[serde(default)]
    pub command_args: CommandArgs,
}

/// Parse a JSON array of job specs
pub fn load_jobs(path: &Path) -> Result<Vec<JobSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job list {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job list {}", path.display()))
}
