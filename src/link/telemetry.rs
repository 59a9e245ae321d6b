use super::channel::{ChannelError, ChannelEvents, SocketChannel};
use super::dispatcher::CommandDispatcher;
use super::message::{wire_timestamp, DeviceEvent, InboundMessage, TelemetryMessage};
use super::state::LinkState;
use crate::config::PushIntervals;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Push cadence for a remote/job combination. The active flag gates the job
/// tiers: without an active operator the job state is irrelevant.
pub fn recompute_interval(is_active: bool, has_job: bool, intervals: &PushIntervals) -> Duration {
    match (is_active, has_job) {
        (true, true) => intervals.active_job(),
        (true, false) => intervals.active_idle(),
        (false, _) => intervals.idle(),
    }
}

/// Extract `n` from a firmware `Flow: n%` report.
pub fn parse_flow_rate(line: &str) -> Option<u32> {
    let start = line.find("Flow: ")? + "Flow: ".len();
    let rest = &line[start..];
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits == 0 || !rest[digits..].starts_with('%') {
        return None;
    }
    rest[..digits].parse().ok()
}

/// Snapshot composition, inbound message handling, and push-interval policy.
///
/// Owns the `active_online`, `remote_connected`, and `push_interval` fields of
/// [`LinkState`]; it is the channel's event handler.
pub struct Telemetry {
    state: Arc<LinkState>,
    dispatcher: CommandDispatcher,
    intervals: PushIntervals,
}

impl Telemetry {
    pub fn new(
        state: Arc<LinkState>,
        dispatcher: CommandDispatcher,
        intervals: PushIntervals,
    ) -> Self {
        Self {
            state,
            dispatcher,
            intervals,
        }
    }

    pub fn state(&self) -> &Arc<LinkState> {
        &self.state
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    async fn compose(&self, event: Option<DeviceEvent>) -> TelemetryMessage {
        let printer = self.dispatcher.printer();
        let storage = self.dispatcher.storage();

        let temperature_data = printer.current_temperatures().await.unwrap_or_else(|e| {
            warn!(component = "telemetry", "Failed to read temperatures: {}", e);
            Value::Null
        });
        let printer_data = printer.current_data().await.unwrap_or_else(|e| {
            warn!(component = "telemetry", "Failed to read printer data: {}", e);
            Value::Null
        });
        let job = printer.current_job().await.unwrap_or_else(|e| {
            warn!(component = "telemetry", "Failed to read current job: {}", e);
            Value::Null
        });
        let files = storage.list_files().await.unwrap_or_else(|e| {
            warn!(component = "telemetry", "Failed to list files: {}", e);
            Value::Null
        });

        TelemetryMessage {
            temperature_data,
            printer_data,
            timestamp: wire_timestamp(Utc::now()),
            files,
            job,
            event,
        }
    }

    /// Compose a fresh snapshot with `extra` merged over the base fields.
    pub async fn build_snapshot(&self, extra: Option<Map<String, Value>>) -> Value {
        self.compose(None).await.into_value_with(extra)
    }

    async fn send_value(&self, channel: &SocketChannel, value: Value) -> bool {
        if !channel.is_connected() {
            debug!(component = "telemetry", "Not connected, snapshot skipped");
            return false;
        }
        let sent = channel.send(value);
        if sent {
            self.state.record_snapshot_sent();
        }
        sent
    }

    /// Send a snapshot on `channel` if it is connected.
    pub async fn push_snapshot(
        &self,
        channel: &SocketChannel,
        extra: Option<Map<String, Value>>,
    ) -> bool {
        if !channel.is_connected() {
            return false;
        }
        let value = self.build_snapshot(extra).await;
        self.send_value(channel, value).await
    }

    /// Send a snapshot on whichever channel is currently installed.
    pub async fn push_to_current(&self, extra: Option<Map<String, Value>>) -> bool {
        match self.state.current_channel() {
            Some(channel) => self.push_snapshot(&channel, extra).await,
            None => false,
        }
    }

    /// Recompute the push interval from the active flag and the printer's job.
    pub async fn refresh_interval(&self) -> Duration {
        let has_job = self.dispatcher.printer().has_job().await;
        let interval = recompute_interval(self.state.is_active_online(), has_job, &self.intervals);
        if self.state.set_push_interval(interval) {
            info!(
                component = "telemetry",
                interval_ms = interval.as_millis() as u64,
                has_job,
                "Push interval changed"
            );
        }
        interval
    }

    /// Handle one inbound text frame.
    pub async fn handle_message(&self, channel: &SocketChannel, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    component = "telemetry",
                    channel_id = %channel.id(),
                    "Skipping inbound message: {}",
                    e
                );
                return;
            }
        };

        let mut push = false;
        if let Some(command) = message.command {
            if let Err(e) = self.dispatcher.dispatch(command).await {
                error!(component = "telemetry", "Command failed: {}", e);
            }
            push = true;
        }

        if let Some(active) = message.active {
            if self.state.set_active_online(active) {
                info!(component = "telemetry", active, "Remote session state changed");
            }
            push |= active;
        }

        if push {
            self.push_snapshot(channel, None).await;
        }
        self.refresh_interval().await;
    }

    /// Forward a printer-host event with a snapshot, then recompute the interval.
    pub async fn on_device_event(&self, event_type: &str, payload: Value) {
        if let Some(channel) = self.state.current_channel() {
            if channel.is_connected() {
                let event = DeviceEvent {
                    event_type: event_type.to_string(),
                    payload,
                };
                let value = self.compose(Some(event)).await.into_value_with(None);
                if !self.send_value(&channel, value).await {
                    debug!(
                        component = "telemetry",
                        event_type = %event_type,
                        "Event not delivered"
                    );
                }
            }
        }
        self.refresh_interval().await;
    }

    /// Inspect a line received from the firmware. A flow-rate report is sent
    /// as an extra `flow_rate` field. The line is passed through unchanged.
    pub async fn on_received_line<'a>(&self, line: &'a str) -> &'a str {
        if let Some(flow_rate) = parse_flow_rate(line) {
            let mut extra = Map::new();
            extra.insert("flow_rate".to_string(), Value::from(flow_rate));
            self.push_to_current(Some(extra)).await;
        }
        line
    }
}

#[async_trait]
impl ChannelEvents for Telemetry {
    async fn on_open(&self, channel: &SocketChannel) {
        info!(component = "telemetry", channel_id = %channel.id(), "Connected to cloud");
        self.state.set_remote_connected(true);
    }

    async fn on_message(&self, channel: &SocketChannel, text: &str) {
        self.handle_message(channel, text).await;
    }

    async fn on_close(&self, channel: &SocketChannel) {
        info!(component = "telemetry", channel_id = %channel.id(), "Disconnected from cloud");
        self.state.set_remote_connected(false);
    }

    async fn on_error(&self, channel: &SocketChannel, error: &ChannelError) {
        warn!(
            component = "telemetry",
            channel_id = %channel.id(),
            url = %channel.url(),
            "Channel error: {}",
            error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, RemoteFile, UploadEndpoints};
    use crate::devices::mock::{MemoryStorage, SimulatedPrinter};
    use crate::link::message::FileId;

    struct NoUploads;

    #[async_trait]
    impl UploadEndpoints for NoUploads {
        async fn request_upload(&self, _file_id: &FileId) -> Result<RemoteFile, CloudError> {
            Err(CloudError::NotReady)
        }

        async fn acknowledge_upload(&self, _file_id: &FileId) -> Result<(), CloudError> {
            Err(CloudError::NotReady)
        }

        async fn post_gcode(&self, _name: &str, _content: Vec<u8>) -> Result<(), CloudError> {
            Err(CloudError::NotReady)
        }

        async fn post_image(
            &self,
            _name: &str,
            _camera: &str,
            _jpeg: Vec<u8>,
        ) -> Result<(), CloudError> {
            Err(CloudError::NotReady)
        }
    }

    fn telemetry() -> (Arc<SimulatedPrinter>, Telemetry) {
        let printer = Arc::new(SimulatedPrinter::new());
        let dispatcher = CommandDispatcher::new(
            printer.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(NoUploads),
        );
        let intervals = PushIntervals::default();
        let state = Arc::new(LinkState::new(intervals.idle()));
        (printer, Telemetry::new(state, dispatcher, intervals))
    }

    #[test]
    fn test_recompute_interval_tiers() {
        let intervals = PushIntervals::default();
        assert_eq!(recompute_interval(true, true, &intervals), Duration::from_millis(400));
        assert_eq!(recompute_interval(true, false, &intervals), Duration::from_millis(800));
        assert_eq!(recompute_interval(false, true, &intervals), Duration::from_secs(30));
        assert_eq!(recompute_interval(false, false, &intervals), Duration::from_secs(30));
        assert_eq!(
            recompute_interval(true, true, &intervals),
            recompute_interval(true, true, &intervals)
        );
    }

    #[test]
    fn test_parse_flow_rate() {
        assert_eq!(parse_flow_rate("echo:E0 Flow: 95%"), Some(95));
        assert_eq!(parse_flow_rate("Flow: 100%"), Some(100));
        assert_eq!(parse_flow_rate("Flow: %"), None);
        assert_eq!(parse_flow_rate("Flow: 95"), None);
        assert_eq!(parse_flow_rate("ok T:210.0 /210.0"), None);
    }

    #[tokio::test]
    async fn test_snapshot_has_base_fields() {
        let (_printer, telemetry) = telemetry();
        let mut extra = Map::new();
        extra.insert("flow_rate".to_string(), Value::from(90));
        let snapshot = telemetry.build_snapshot(Some(extra)).await;

        for key in ["temperature_data", "printer_data", "timestamp", "files", "job", "flow_rate"] {
            assert!(snapshot.get(key).is_some(), "missing {}", key);
        }
        assert!(snapshot.get("event").is_none());
        assert_eq!(snapshot["printer_data"]["state"]["text"], "Operational");
    }

    #[tokio::test]
    async fn test_interval_follows_state_and_job() {
        let (printer, telemetry) = telemetry();
        let state = telemetry.state().clone();
        assert_eq!(state.push_interval(), Duration::from_secs(30));

        // No channel is installed; classification and policy still apply.
        state.set_active_online(true);
        assert_eq!(telemetry.refresh_interval().await, Duration::from_millis(800));

        printer.set_job_active(true);
        telemetry.on_device_event("PrintStarted", Value::Null).await;
        assert_eq!(state.push_interval(), Duration::from_millis(400));

        printer.set_job_active(false);
        telemetry.on_device_event("PrintDone", Value::Null).await;
        assert_eq!(state.push_interval(), Duration::from_millis(800));

        printer.set_job_active(true);
        state.set_active_online(false);
        assert_eq!(telemetry.refresh_interval().await, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_received_line_passes_through() {
        let (_printer, telemetry) = telemetry();
        assert_eq!(telemetry.on_received_line("Flow: 90%").await, "Flow: 90%");
        assert_eq!(telemetry.state().snapshots_sent(), 0);
    }
}
