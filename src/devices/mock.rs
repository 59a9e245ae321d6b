use super::{Destination, DeviceError, FileStorage, Printer};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct SelectedFile {
    path: String,
    on_sd: bool,
}

#[derive(Debug)]
struct PrinterModel {
    operational: bool,
    printing: bool,
    paused: bool,
    selected: Option<SelectedFile>,
    targets: BTreeMap<String, f64>,
    offsets: BTreeMap<String, f64>,
    flow_rate: f64,
    feed_rate: f64,
    z_offset: f64,
    tool: String,
}

impl Default for PrinterModel {
    fn default() -> Self {
        Self {
            operational: true,
            printing: false,
            paused: false,
            selected: None,
            targets: BTreeMap::from([("tool0".to_string(), 0.0), ("bed".to_string(), 0.0)]),
            offsets: BTreeMap::new(),
            flow_rate: 100.0,
            feed_rate: 100.0,
            z_offset: 0.0,
            tool: "tool0".to_string(),
        }
    }
}

/// In-process printer used by the binary's simulation mode and by tests.
///
/// Every operation is appended to a call log so callers can assert on exactly
/// which collaborator methods were reached.
#[derive(Debug, Default)]
pub struct SimulatedPrinter {
    model: Mutex<PrinterModel>,
    calls: Mutex<Vec<String>>,
    latency_ms: Option<u64>,
}

impl SimulatedPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Force a job on or off without going through `select_file`.
    pub fn set_job_active(&self, active: bool) {
        let mut model = self.model.lock();
        model.printing = active;
        model.paused = false;
        if active && model.selected.is_none() {
            model.selected = Some(SelectedFile {
                path: "benchy.gcode".to_string(),
                on_sd: false,
            });
        }
    }

    pub fn set_operational(&self, operational: bool) {
        self.model.lock().operational = operational;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split(':').next() == Some(name))
            .count()
    }

    pub fn flow_rate(&self) -> f64 {
        self.model.lock().flow_rate
    }

    pub fn z_offset(&self) -> f64 {
        self.model.lock().z_offset
    }

    fn record(&self, call: String) {
        debug!(component = "printer", call = %call, "Simulated printer call");
        self.calls.lock().push(call);
    }

    async fn simulate_operation(&self) {
        if let Some(ms) = self.latency_ms {
            sleep(Duration::from_millis(ms)).await;
        }
    }

    fn require_operational(&self) -> Result<(), DeviceError> {
        if self.model.lock().operational {
            Ok(())
        } else {
            Err(DeviceError::NotOperational)
        }
    }

    fn apply_gcode(model: &mut PrinterModel, line: &str) {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("M221") => {
                if let Some(s) = parts.find_map(|p| p.strip_prefix('S')) {
                    if let Ok(v) = s.parse::<f64>() {
                        if v > 0.0 {
                            model.flow_rate = v;
                        }
                    }
                }
            }
            Some("M206") => {
                if let Some(z) = parts.find_map(|p| p.strip_prefix('Z')) {
                    if let Ok(v) = z.parse::<f64>() {
                        model.z_offset = v;
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Printer for SimulatedPrinter {
    async fn pause(&self) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record("pause".to_string());
        let mut model = self.model.lock();
        if model.printing {
            model.paused = true;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record("resume".to_string());
        self.model.lock().paused = false;
        Ok(())
    }

    async fn cancel(&self) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record("cancel".to_string());
        let mut model = self.model.lock();
        model.printing = false;
        model.paused = false;
        Ok(())
    }

    async fn toggle_pause(&self) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record("toggle_pause".to_string());
        let mut model = self.model.lock();
        if model.printing {
            model.paused = !model.paused;
        }
        Ok(())
    }

    async fn select_file(
        &self,
        path: &str,
        on_sd: bool,
        print_after_select: bool,
    ) -> Result<(), DeviceError> {
        self.require_operational()?;
        self.simulate_operation().await;
        self.record(format!(
            "select_file:{}:sd={}:print={}",
            path, on_sd, print_after_select
        ));
        let mut model = self.model.lock();
        model.selected = Some(SelectedFile {
            path: path.to_string(),
            on_sd,
        });
        if print_after_select {
            model.printing = true;
            model.paused = false;
        }
        Ok(())
    }

    async fn home(&self, axes: Option<Vec<String>>) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        match axes {
            Some(axes) => self.record(format!("home:{}", axes.join(","))),
            None => self.record("home".to_string()),
        }
        Ok(())
    }

    async fn jog(&self, axes: HashMap<String, f64>) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        let sorted: BTreeMap<_, _> = axes.into_iter().collect();
        let desc: Vec<String> = sorted.iter().map(|(a, d)| format!("{}={}", a, d)).collect();
        self.record(format!("jog:{}", desc.join(",")));
        Ok(())
    }

    async fn extrude(&self, amount: f64) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record(format!("extrude:{}", amount));
        Ok(())
    }

    async fn change_tool(&self, tool: &str) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record(format!("change_tool:{}", tool));
        self.model.lock().tool = tool.to_string();
        Ok(())
    }

    async fn feed_rate(&self, factor: f64) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record(format!("feed_rate:{}", factor));
        // Factors in (0, 1] are fractions, larger values are percentages.
        let percent = if factor <= 1.0 { factor * 100.0 } else { factor };
        self.model.lock().feed_rate = percent;
        Ok(())
    }

    async fn set_temperature(&self, heater: &str, value: f64) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record(format!("set_temperature:{}={}", heater, value));
        self.model.lock().targets.insert(heater.to_string(), value);
        Ok(())
    }

    async fn set_temperature_offset(
        &self,
        offsets: HashMap<String, f64>,
    ) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        let sorted: BTreeMap<_, _> = offsets.into_iter().collect();
        let desc: Vec<String> = sorted.iter().map(|(h, o)| format!("{}={}", h, o)).collect();
        self.record(format!("set_temperature_offset:{}", desc.join(",")));
        self.model.lock().offsets.extend(sorted);
        Ok(())
    }

    async fn commands(&self, commands: Vec<String>) -> Result<(), DeviceError> {
        self.simulate_operation().await;
        self.record(format!("commands:{}", commands.join(";")));
        let mut model = self.model.lock();
        for line in &commands {
            Self::apply_gcode(&mut model, line);
        }
        Ok(())
    }

    async fn current_job(&self) -> Result<Value, DeviceError> {
        let model = self.model.lock();
        let file = match &model.selected {
            Some(sel) => {
                let origin = if sel.on_sd { "sdcard" } else { "local" };
                json!({
                    "name": sel.path.rsplit('/').next().unwrap_or(&sel.path),
                    "path": sel.path,
                    "origin": origin,
                })
            }
            None => json!({ "name": null, "path": null, "origin": null }),
        };
        Ok(json!({ "file": file, "estimatedPrintTime": null }))
    }

    async fn current_data(&self) -> Result<Value, DeviceError> {
        let model = self.model.lock();
        let text = match (model.operational, model.printing, model.paused) {
            (false, _, _) => "Offline",
            (true, true, true) => "Paused",
            (true, true, false) => "Printing",
            (true, false, _) => "Operational",
        };
        Ok(json!({
            "state": {
                "text": text,
                "flags": {
                    "operational": model.operational,
                    "printing": model.printing && !model.paused,
                    "paused": model.paused,
                    "ready": model.operational && !model.printing,
                },
            },
            "flow_rate": model.flow_rate,
            "feed_rate": model.feed_rate,
            "z_offset": model.z_offset,
            "tool": model.tool,
        }))
    }

    async fn current_temperatures(&self) -> Result<Value, DeviceError> {
        let model = self.model.lock();
        let mut temps = serde_json::Map::new();
        for (heater, target) in &model.targets {
            let offset = model.offsets.get(heater).copied().unwrap_or(0.0);
            temps.insert(
                heater.clone(),
                json!({ "actual": 21.0, "target": target, "offset": offset }),
            );
        }
        Ok(Value::Object(temps))
    }

    async fn has_job(&self) -> bool {
        self.model.lock().printing
    }

    async fn is_operational(&self) -> bool {
        self.model.lock().operational
    }
}

/// Storage backend kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<(Destination, String), Vec<u8>>>,
    folders: Mutex<BTreeSet<(Destination, String)>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn contains_file(&self, destination: Destination, path: &str) -> bool {
        self.files
            .lock()
            .contains_key(&(destination, path.to_string()))
    }

    pub fn contains_folder(&self, destination: Destination, path: &str) -> bool {
        self.folders
            .lock()
            .contains(&(destination, path.to_string()))
    }

    fn record(&self, call: String) {
        debug!(component = "storage", call = %call, "Memory storage call");
        self.calls.lock().push(call);
    }

    fn listing(&self, destination: Destination) -> Vec<Value> {
        let mut entries: Vec<Value> = self
            .folders
            .lock()
            .iter()
            .filter(|(d, _)| *d == destination)
            .map(|(_, p)| json!({ "name": p, "path": p, "type": "folder" }))
            .collect();
        entries.extend(
            self.files
                .lock()
                .iter()
                .filter(|((d, _), _)| *d == destination)
                .map(|((_, p), content)| {
                    json!({
                        "name": p.rsplit('/').next().unwrap_or(p),
                        "path": p,
                        "type": "machinecode",
                        "size": content.len(),
                    })
                }),
        );
        entries
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn add_file(
        &self,
        destination: Destination,
        path: &str,
        content: Vec<u8>,
    ) -> Result<String, DeviceError> {
        if path.is_empty() {
            return Err(DeviceError::InvalidArgument("empty file path".to_string()));
        }
        self.record(format!("add_file:{:?}:{}", destination, path));
        self.files
            .lock()
            .insert((destination, path.to_string()), content);
        info!(component = "storage", path = %path, "Stored file");
        Ok(path.to_string())
    }

    async fn remove_file(&self, destination: Destination, path: &str) -> Result<(), DeviceError> {
        self.record(format!("remove_file:{:?}:{}", destination, path));
        self.files
            .lock()
            .remove(&(destination, path.to_string()))
            .map(|_| ())
            .ok_or_else(|| DeviceError::Storage(format!("no such file: {}", path)))
    }

    async fn add_folder(&self, destination: Destination, path: &str) -> Result<(), DeviceError> {
        self.record(format!("add_folder:{:?}:{}", destination, path));
        // Existing folders are ignored.
        self.folders.lock().insert((destination, path.to_string()));
        Ok(())
    }

    async fn remove_folder(
        &self,
        destination: Destination,
        path: &str,
    ) -> Result<(), DeviceError> {
        self.record(format!("remove_folder:{:?}:{}", destination, path));
        let prefix = format!("{}/", path);
        self.files
            .lock()
            .retain(|(d, p), _| !(*d == destination && p.starts_with(&prefix)));
        self.folders
            .lock()
            .retain(|(d, p)| !(*d == destination && (p == path || p.starts_with(&prefix))));
        Ok(())
    }

    async fn read_file(
        &self,
        destination: Destination,
        path: &str,
    ) -> Result<Vec<u8>, DeviceError> {
        self.files
            .lock()
            .get(&(destination, path.to_string()))
            .cloned()
            .ok_or_else(|| DeviceError::Storage(format!("no such file: {}", path)))
    }

    async fn list_files(&self) -> Result<Value, DeviceError> {
        Ok(json!({
            "local": self.listing(Destination::Local),
            "sdcard": self.listing(Destination::Sdcard),
        }))
    }
}
