use procwatch::supervisor::client::ActionClient;
use procwatch::supervisor::config::Config;
use procwatch::supervisor::job::StopTimeouts;
use procwatch::supervisor::service::JobControlService;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// In-process service bound to an ephemeral port.
///
/// Call `shutdown` at the end of a test; if the test panics first, dropping
/// the runtime kills the direct children through `kill_on_drop`.
pub struct ServiceGuard {
    service: Arc<JobControlService>,
    url: String,
    _state_dir: tempfile::TempDir,
}

impl ServiceGuard {
    /// Short intervals so broadcasts happen within a test's patience
    pub fn test_config(state_dir: &std::path::Path) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            state_dir: state_dir.to_path_buf(),
            jobs_file: None,
            summary_interval: Duration::from_secs(2),
            output_interval: Duration::from_millis(300),
            stop_timeouts: StopTimeouts {
                interrupt: Duration::from_millis(500),
                terminate: Duration::from_millis(500),
            },
        }
    }

    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let state_dir = tempfile::tempdir().expect("create state dir");
        let mut config = Self::test_config(state_dir.path());
        tweak(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("listener address");

        let service = Arc::new(JobControlService::new(&config));
        service.start(listener).await.expect("start service");
        println!("Started job control service on {}", addr);

        Self {
            service,
            url: format!("ws://{}", addr),
            _state_dir: state_dir,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn service(&self) -> &Arc<JobControlService> {
        &self.service
    }

    pub async fn connect(&self) -> ActionClient {
        ActionClient::connect_with_retry(&self.url)
            .await
            .expect("connect to service")
    }

    pub async fn shutdown(self) {
        self.service.shutdown().await;
    }
}

/// Check if a process is still running
pub fn process_is_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
