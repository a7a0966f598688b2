// procwatch-daemon: supervises shell commands and serves the action protocol
//
// Loads the environment config (overridable by flags), registers the initial
// job list, then serves websocket clients until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use procwatch::supervisor::{config::Config, service::JobControlService};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "procwatch-daemon")]
#[command(about = "Supervise shell commands and control them over a websocket")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "PROCWATCH_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, short = 'p', env = "PROCWATCH_PORT")]
    port: Option<u16>,

    /// JSON file with the initial job list
    #[arg(long, short = 'j', env = "PROCWATCH_JOBS")]
    jobs: Option<PathBuf>,

    /// Seconds between periodic job summaries
    #[arg(long, env = "PROCWATCH_SUMMARY_SECS")]
    summary_secs: Option<u64>,

    /// Milliseconds over which job output is coalesced
    #[arg(long, env = "PROCWATCH_OUTPUT_MS")]
    output_ms: Option<u64>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(jobs) = &self.jobs {
            config.jobs_file = Some(jobs.clone());
        }
        if let Some(secs) = self.summary_secs {
            config.summary_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(millis) = self.output_ms {
            config.output_interval = std::time::Duration::from_millis(millis);
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("procwatch={}", level)));
    fmt().with_env_filter(filter).init();
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = Config::from_env();
    args.apply(&mut config);

    let jobs = config.load_jobs()?;

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
    config.write_pid().context("Failed to write PID file")?;

    let service = JobControlService::new(&config);
    service.start(listener).await?;
    service
        .seed_jobs(jobs)
        .await
        .context("Failed to register initial jobs")?;

    info!(url = %config.url(), "Daemon listening");

    wait_for_shutdown_signal().await?;
    info!("Shutting down daemon...");
    service.shutdown().await;

    if let Err(err) = config.remove_pid() {
        warn!("Failed to remove PID file: {}", err);
    }
    info!("Daemon stopped");
    Ok(())
}
