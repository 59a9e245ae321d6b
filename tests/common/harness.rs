//! Test harness wiring a supervisor to the simulated printer and storage.
//!
//! Cleanup is explicit: call `shutdown().await` at the end of each test.

use super::uploads::RecordingUploads;
use printer_cloud_link::config::{LinkConfig, PushIntervals};
use printer_cloud_link::devices::mock::{MemoryStorage, SimulatedPrinter};
use printer_cloud_link::devices::DeviceError;
use printer_cloud_link::link::{
    CommandDispatcher, LinkState, ShutdownHandle, Supervisor, Telemetry,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

pub type TestResult<T = ()> = Result<T, TestError>;

#[derive(Debug, Error)]
pub enum TestError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

pub const TEST_TOKEN: &str = "testtoken123";

/// Config pointing at `base_url` with a token and fast, test-sized tunables.
pub fn test_config(base_url: &str) -> LinkConfig {
    LinkConfig {
        base_url: base_url.to_string(),
        auth_token: Some(TEST_TOKEN.to_string()),
        connect_timeout_ms: 2000,
        request_timeout_ms: 2000,
        ..Default::default()
    }
}

pub struct LinkHarness {
    pub printer: Arc<SimulatedPrinter>,
    pub storage: Arc<MemoryStorage>,
    pub uploads: Arc<RecordingUploads>,
    pub state: Arc<LinkState>,
    pub telemetry: Arc<Telemetry>,
    pub supervisor: Arc<Supervisor>,
    task: Option<JoinHandle<()>>,
}

impl LinkHarness {
    /// Build every component; the supervisor is not started yet.
    pub fn new(config: LinkConfig, backoff_max: Duration) -> Self {
        let printer = Arc::new(SimulatedPrinter::new());
        let storage = Arc::new(MemoryStorage::new());
        let uploads = Arc::new(RecordingUploads::new());

        let state = Arc::new(LinkState::new(config.push.idle()));
        let dispatcher = CommandDispatcher::new(printer.clone(), storage.clone(), uploads.clone());
        let telemetry = Arc::new(Telemetry::new(
            state.clone(),
            dispatcher,
            config.push.clone(),
        ));
        let supervisor =
            Arc::new(Supervisor::new(config, telemetry.clone()).with_backoff_max(backoff_max));

        Self {
            printer,
            storage,
            uploads,
            state,
            telemetry,
            supervisor,
            task: None,
        }
    }

    /// Harness against `base_url` with a 50ms backoff ceiling.
    pub fn for_server(base_url: &str) -> Self {
        Self::new(test_config(base_url), Duration::from_millis(50))
    }

    pub fn with_intervals(base_url: &str, push: PushIntervals) -> Self {
        let config = LinkConfig {
            push,
            ..test_config(base_url)
        };
        Self::new(config, Duration::from_millis(50))
    }

    pub fn start(&mut self) {
        let supervisor = self.supervisor.clone();
        self.task = Some(tokio::spawn(async move { supervisor.run().await }));
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.supervisor.shutdown_handle()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> TestResult<()> {
        let state = self.state.clone();
        super::Assertions::wait_for(move || state.is_connected(), timeout, "channel connected").await
    }

    /// Shut the supervisor down and wait for its task to finish.
    pub async fn shutdown(mut self) -> TestResult<()> {
        self.shutdown_handle().shutdown();
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .map_err(|_| TestError::Timeout("supervisor did not stop".to_string()))?
                .map_err(|e| TestError::TaskFailed(e.to_string()))?;
        }
        Ok(())
    }
}
