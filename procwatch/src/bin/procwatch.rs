// procwatch: CLI for a running procwatch-daemon
//
// Commands:
//   procwatch add <uid> <cmd> [--group] [--arg key=value]...
//   procwatch start <uid> [--arg key=value]...
//   procwatch stop <uid>
//   procwatch restart <uid> [--ignore-stop-failure]
//   procwatch remove <uid>
//   procwatch list
//   procwatch watch [uid]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use procwatch::supervisor::client::{run_single_action, ActionClient};
use procwatch::supervisor::config::{DEFAULT_HOST, DEFAULT_PORT};
use procwatch::supervisor::protocol::{ActionResponse, JobData, ServerMessage};
use serde_json::{json, Map, Value};
use std::io::Write;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "procwatch")]
#[command(about = "Control jobs supervised by procwatch-daemon")]
#[command(version)]
struct Cli {
    /// Daemon host
    #[arg(long, env = "PROCWATCH_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Daemon port
    #[arg(long, short = 'p', env = "PROCWATCH_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Print raw JSON replies
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a job (or reconfigure a stopped one)
    Add {
        uid: String,
        /// Shell command, may contain {key} placeholders
        cmd: String,
        /// Run in its own process group and signal the whole group
        #[arg(long)]
        group: bool,
        /// Default placeholder value (key=value, value parsed as JSON if possible)
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, Value)>,
    },

    /// Remove a job that is not running
    Remove { uid: String },

    /// Start a job
    Start {
        uid: String,
        /// Placeholder override for this run (key=value)
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, Value)>,
    },

    /// Stop a job (SIGINT, then SIGTERM, then SIGKILL)
    Stop { uid: String },

    /// Stop a job if needed and start it again
    Restart {
        uid: String,
        /// Restart even if stopping the old run failed
        #[arg(long)]
        ignore_stop_failure: bool,
    },

    /// List all jobs
    List,

    /// Stream state changes and output until interrupted
    Watch {
        /// Only show events of this job
        uid: Option<String>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn to_map(args: Vec<(String, Value)>) -> Value {
    Value::Object(args.into_iter().collect())
}

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn print_jobs(jobs: &[JobData]) {
    if jobs.is_empty() {
        println!("No jobs registered");
        return;
    }

    println!("{:<20} {:<12} {:>6} {:>8}  COMMAND", "UID", "STATE", "EXIT", "PID");
    for job in jobs {
        let exit = job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        let pid = job.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:<20} {:<12} {:>6} {:>8}  {}",
            job.uid, job.state, exit, pid, job.command
        );
    }
}

fn print_response(response: &ActionResponse, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else if let Some(message) = response.error_message() {
        bail!("{} failed: {}", response.action, message);
    } else if response.action == "list" {
        let jobs: Vec<JobData> = serde_json::from_value(response.data.clone())?;
        print_jobs(&jobs);
    } else if response.action == "stop" {
        println!("Stopped '{}' (exit code {})", response.uid.as_deref().unwrap_or("?"), response.data);
    } else {
        let state = response.data.get("state").and_then(Value::as_str).unwrap_or("-");
        println!("{} '{}': {}", response.action, response.uid.as_deref().unwrap_or("?"), state);
    }

    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn watch(url: &str, only: Option<String>, as_json: bool) -> Result<()> {
    let mut client = ActionClient::connect(url).await?;
    let wanted = |uid: &str| only.as_deref().map_or(true, |only| only == uid);

    loop {
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = client.next_message() => message?,
        };
        let Some(message) = message else {
            eprintln!("Daemon closed the connection");
            break;
        };

        if as_json {
            println!("{}", serde_json::to_string(&message)?);
            continue;
        }
        match message {
            ServerMessage::StateChangedEvent(event) if wanted(&event.uid) => match event.exit_code {
                Some(code) => println!("[{}] {} (exit code {})", event.uid, event.state, code),
                None => println!("[{}] {}", event.uid, event.state),
            },
            ServerMessage::OutputEvent(event) if wanted(&event.uid) => {
                let mut stdout = std::io::stdout().lock();
                for line in event.output.lines() {
                    writeln!(stdout, "[{}] {}", event.uid, line)?;
                }
            }
            ServerMessage::ProcessSummaryEvent(jobs) if only.is_none() => {
                println!("-- {} jobs", jobs.len());
            }
            _ => {}
        }
    }

    client.close().await.ok();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let url = format!("ws://{}:{}", cli.host, cli.port);

    let (action, payload) = match cli.command {
        Commands::Add {
            uid,
            cmd,
            group,
            args,
        } => (
            "add",
            json!({"uid": uid, "cmd": cmd, "group": group, "commandArgs": to_map(args)}),
        ),
        Commands::Remove { uid } => ("remove", json!({ "uid": uid })),
        Commands::Start { uid, args } => ("start", json!({"uid": uid, "commandArgs": to_map(args)})),
        Commands::Stop { uid } => ("stop", json!({ "uid": uid })),
        Commands::Restart {
            uid,
            ignore_stop_failure,
        } => (
            "restart",
            json!({"uid": uid, "ignoreStopFailure": ignore_stop_failure}),
        ),
        Commands::List => ("list", json!({})),
        Commands::Watch { uid } => return watch(&url, uid, cli.json).await,
    };

    let response = run_single_action(&url, action, data(payload)).await?;
    print_response(&response, cli.json)
}
