//! Low-frequency job and camera sampling.
//!
//! Runs beside the channel on its own timer. Each tick detects the start of a
//! new print job (uploading its gcode once and asking the firmware for its
//! flow rate) and, while a job runs, posts camera snapshots at each camera's
//! own interval.

use crate::cloud::CloudError;
use crate::config::{CameraConfig, LinkConfig};
use crate::devices::Destination;
use crate::link::{wait_for_flag, ShutdownHandle, Telemetry};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct CameraSlot {
    config: CameraConfig,
    since_last: Duration,
}

/// What a single tick did, for callers that drive the sampler by hand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub ready: bool,
    pub new_job: bool,
    pub snapshots: Vec<String>,
}

pub struct Sampler {
    config: LinkConfig,
    telemetry: Arc<Telemetry>,
    http_client: reqwest::Client,
    cameras: Vec<CameraSlot>,
    awaiting_job: bool,
    snapshot_count: u64,
    period: Duration,
}

impl Sampler {
    pub fn new(config: LinkConfig, telemetry: Arc<Telemetry>) -> Self {
        let http_client = crate::cloud::http_client(config.request_timeout());
        let cameras = config
            .sampler
            .cameras
            .iter()
            .cloned()
            .map(|config| CameraSlot {
                config,
                since_last: Duration::ZERO,
            })
            .collect();

        Self {
            period: Duration::from_millis(config.sampler.tick_ms),
            config,
            telemetry,
            http_client,
            cameras,
            awaiting_job: true,
            snapshot_count: 0,
        }
    }

    pub fn snapshot_count(&self) -> u64 {
        self.snapshot_count
    }

    /// Tick until shutdown.
    pub async fn run(mut self, shutdown: ShutdownHandle) {
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = shutdown.subscribe();
        info!(
            component = "sampler",
            tick_ms = self.period.as_millis() as u64,
            cameras = self.cameras.len(),
            "Sampler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = wait_for_flag(&mut shutdown_rx) => break,
                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }
        info!(component = "sampler", snapshots = self.snapshot_count, "Sampler stopped");
    }

    /// One sampling pass.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if !self.config.enabled {
            return report;
        }
        if !self.config.is_setup_complete() {
            warn!(component = "sampler", "Printer not ready: missing base URL or auth token");
            return report;
        }
        report.ready = true;

        self.telemetry.refresh_interval().await;

        let printer = self.telemetry.dispatcher().printer().clone();
        if !printer.has_job().await {
            if printer.is_operational().await {
                self.awaiting_job = true;
                self.snapshot_count = 0;
            }
            for camera in &mut self.cameras {
                camera.since_last = Duration::ZERO;
            }
            return report;
        }

        let job = printer.current_job().await.unwrap_or(Value::Null);
        if self.awaiting_job {
            self.awaiting_job = false;
            report.new_job = true;
            self.start_job(&job).await;
        }

        let print_name = print_name(&job);
        for index in 0..self.cameras.len() {
            self.cameras[index].since_last += self.period;
            let due = Duration::from_secs(self.cameras[index].config.interval_secs);
            if self.cameras[index].since_last < due {
                continue;
            }
            self.cameras[index].since_last = Duration::ZERO;

            let camera = self.cameras[index].config.clone();
            let name = format!("{}-{}-cam{}.jpg", print_name, self.snapshot_count, index + 1);
            self.snapshot_count += 1;
            if self.post_snapshot(&camera, index + 1, &name).await {
                report.snapshots.push(name);
            }
        }
        report
    }

    async fn start_job(&self, job: &Value) {
        let dispatcher = self.telemetry.dispatcher();
        let file = &job["file"];
        info!(component = "sampler", file = %file["name"], "New print job");

        match (file["path"].as_str(), file["name"].as_str()) {
            (Some(path), Some(name)) => {
                let destination = if file["origin"].as_str() == Some("sdcard") {
                    Destination::Sdcard
                } else {
                    Destination::Local
                };
                match dispatcher.storage().read_file(destination, path).await {
                    Ok(content) => {
                        if let Err(e) = dispatcher.uploads().post_gcode(name, content).await {
                            warn!(component = "sampler", "Failed to post gcode: {}", e);
                        }
                    }
                    Err(e) => warn!(
                        component = "sampler",
                        path = %path,
                        "Cannot read job gcode: {}",
                        e
                    ),
                }
            }
            _ => debug!(component = "sampler", "Job has no file, gcode not posted"),
        }

        if let Err(e) = dispatcher.printer().commands(vec!["M221".to_string()]).await {
            warn!(component = "sampler", "Flow rate query failed: {}", e);
        }
    }

    async fn fetch_snapshot(&self, camera: &CameraConfig) -> Result<Vec<u8>, CloudError> {
        let url = camera.snapshot_url.as_str();
        let request_error = |source: reqwest::Error| CloudError::Request {
            method: Method::GET,
            url: url.to_string(),
            source,
        };
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(CloudError::Status {
                method: Method::GET,
                url: url.to_string(),
                status: response.status(),
            });
        }
        let body = response.bytes().await.map_err(request_error)?;
        Ok(body.to_vec())
    }

    async fn post_snapshot(&self, camera: &CameraConfig, number: usize, name: &str) -> bool {
        let jpeg = match self.fetch_snapshot(camera).await {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!(
                    component = "sampler",
                    url = %camera.snapshot_url,
                    "Camera snapshot failed: {}",
                    e
                );
                return false;
            }
        };

        let label = camera
            .label
            .clone()
            .unwrap_or_else(|| format!("cam{}", number));
        match self
            .telemetry
            .dispatcher()
            .uploads()
            .post_image(name, &label, jpeg)
            .await
        {
            Ok(()) => {
                self.telemetry.state().record_image_sent();
                true
            }
            Err(e) => {
                warn!(component = "sampler", name = %name, "Failed to post snapshot: {}", e);
                false
            }
        }
    }
}

/// Job file name without its extension, or `print` when no job file is known.
fn print_name(job: &Value) -> String {
    let name = job["file"]["name"].as_str().unwrap_or("print");
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}
