use crate::devices::Destination;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Wire format of the `timestamp` field, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn wire_timestamp(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// A printer-host event forwarded alongside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEvent {
    pub event_type: String,
    pub payload: Value,
}

/// Outbound telemetry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryMessage {
    pub temperature_data: Value,
    pub printer_data: Value,
    pub timestamp: String,
    pub files: Value,
    pub job: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<DeviceEvent>,
}

impl TelemetryMessage {
    /// Serialize to a JSON object with `extra` merged over the base fields.
    pub fn into_value_with(self, extra: Option<Map<String, Value>>) -> Value {
        let mut object = match serde_json::to_value(self) {
            Ok(Value::Object(object)) => object,
            _ => Map::new(),
        };
        if let Some(extra) = extra {
            object.extend(extra);
        }
        Value::Object(object)
    }
}

/// Why an inbound command was not acted upon.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    #[error("unknown command")]
    Unknown,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{0}'")]
    InvalidField(&'static str),
}

/// Upload id as sent by the cloud. Echoed back with its original JSON type,
/// so `7` stays a number and `"7"` stays a string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FileId(Value);

impl FileId {
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        FileId(Value::String(id.to_string()))
    }
}

impl From<u64> for FileId {
    fn from(id: u64) -> Self {
        FileId(Value::from(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    File,
    Folder,
}

/// A decoded remote command. Malformed or unrecognised input decodes to
/// `Ignored` rather than failing.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pause,
    Resume,
    Cancel,
    Toggle,
    Print { file: String, loc: Destination },
    Select { file: String, loc: Destination },
    Home { axes: Option<Vec<String>> },
    Jog { axes: HashMap<String, f64> },
    Extrude { amount: f64 },
    Retract { amount: f64 },
    ChangeTool { tool: String },
    FeedRate { factor: f64 },
    FlowRate { factor: f64 },
    Gcode { commands: Vec<String> },
    Temperature { heater: String, value: f64 },
    TemperatureOffset { offsets: HashMap<String, f64> },
    ZAdjust { height: f64 },
    UploadRequest { id: FileId, loc: Destination },
    NewFolder { folder: String, loc: Destination },
    Delete { path: String, loc: Destination, kind: DeleteKind },
    Ignored { cmd: String, reason: IgnoreReason },
}

/// Raw inbound fields. Every field is kept as untyped JSON so that one bad
/// field only disqualifies the command that needs it.
#[derive(Debug, Default)]
struct RawCommand {
    cmd: String,
    file: Option<Value>,
    loc: Option<Value>,
    axes: Option<Value>,
    amount: Option<Value>,
    factor: Option<Value>,
    heater: Option<Value>,
    value: Option<Value>,
    offsets: Option<Value>,
    height: Option<Value>,
    id: Option<Value>,
    folder: Option<Value>,
    kind: Option<Value>,
    tool: Option<Value>,
    commands: Option<Value>,
}

impl RawCommand {
    /// `None` unless `cmd` is a string. Short aliases (`amt`, `val`) are read
    /// only when the long name is absent or null.
    fn from_object(object: &Map<String, Value>) -> Option<Self> {
        let cmd = object.get("cmd")?.as_str()?.to_string();
        let field = |name: &str| object.get(name).filter(|v| !v.is_null()).cloned();
        let aliased = |name: &str, alias: &str| field(name).or_else(|| field(alias));

        Some(Self {
            cmd,
            file: field("file"),
            loc: field("loc"),
            axes: field("axes"),
            amount: aliased("amount", "amt"),
            factor: field("factor"),
            heater: field("heater"),
            value: aliased("value", "val"),
            offsets: field("offsets"),
            height: field("height"),
            id: field("id"),
            folder: field("folder"),
            kind: field("type"),
            tool: field("tool"),
            commands: field("commands"),
        })
    }
}

type Field<T> = Result<T, IgnoreReason>;

fn required<'a>(value: &'a Option<Value>, name: &'static str) -> Field<&'a Value> {
    match value {
        Some(Value::Null) | None => Err(IgnoreReason::MissingField(name)),
        Some(v) => Ok(v),
    }
}

fn string_field(value: &Option<Value>, name: &'static str) -> Field<String> {
    match required(value, name)? {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(IgnoreReason::InvalidField(name)),
    }
}

fn number_field(value: &Option<Value>, name: &'static str) -> Field<f64> {
    let number = match required(value, name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number
        .filter(|n| n.is_finite())
        .ok_or(IgnoreReason::InvalidField(name))
}

fn number_map(value: &Option<Value>, name: &'static str) -> Field<HashMap<String, f64>> {
    let object = required(value, name)?
        .as_object()
        .ok_or(IgnoreReason::InvalidField(name))?;
    let mut out = HashMap::with_capacity(object.len());
    for (key, v) in object {
        let n = number_field(&Some(v.clone()), name)?;
        out.insert(key.clone(), n);
    }
    if out.is_empty() {
        return Err(IgnoreReason::InvalidField(name));
    }
    Ok(out)
}

fn file_id(value: &Option<Value>) -> Field<FileId> {
    match required(value, "id")? {
        Value::String(s) if !s.trim().is_empty() => Ok(FileId(Value::String(s.clone()))),
        Value::Number(n) => Ok(FileId(Value::Number(n.clone()))),
        _ => Err(IgnoreReason::InvalidField("id")),
    }
}

fn destination(value: &Option<Value>) -> Field<Destination> {
    string_field(value, "loc").map(|loc| Destination::from_loc(&loc))
}

/// `bed` stays as-is, `tool3` stays as-is, anything else `n` becomes `tool<n>`.
fn tool_name(raw: String) -> String {
    if raw.eq_ignore_ascii_case("bed") || raw.starts_with("tool") {
        raw
    } else {
        format!("tool{}", raw)
    }
}

fn axes_list(value: &Option<Value>) -> Field<Option<Vec<String>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(axis)) if !axis.is_empty() => Ok(Some(vec![axis.clone()])),
        Some(Value::Array(items)) => {
            let axes: Option<Vec<String>> = items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect();
            match axes {
                Some(axes) if !axes.is_empty() => Ok(Some(axes)),
                _ => Err(IgnoreReason::InvalidField("axes")),
            }
        }
        Some(_) => Err(IgnoreReason::InvalidField("axes")),
    }
}

fn gcode_lines(value: &Option<Value>) -> Field<Vec<String>> {
    let lines: Vec<String> = match required(value, "commands")? {
        Value::String(block) => block.lines().map(str::to_string).collect(),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or(IgnoreReason::InvalidField("commands"))?,
        _ => return Err(IgnoreReason::InvalidField("commands")),
    };
    let lines: Vec<String> = lines
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(IgnoreReason::InvalidField("commands"));
    }
    Ok(lines)
}

impl Command {
    /// Decode a command object. Returns `None` if there is no string `cmd`.
    pub fn decode(message: &Value) -> Option<Command> {
        let raw = RawCommand::from_object(message.as_object()?)?;
        let name = raw.cmd.to_lowercase();
        let decoded = Self::decode_raw(&name, &raw);
        Some(decoded.unwrap_or_else(|reason| Command::Ignored { cmd: name, reason }))
    }

    fn decode_raw(name: &str, raw: &RawCommand) -> Field<Command> {
        let command = match name {
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "cancel" => Command::Cancel,
            "toggle" => Command::Toggle,
            "print" => Command::Print {
                file: string_field(&raw.file, "file")?,
                loc: destination(&raw.loc)?,
            },
            "select" => Command::Select {
                file: string_field(&raw.file, "file")?,
                loc: destination(&raw.loc)?,
            },
            "home" => Command::Home {
                axes: axes_list(&raw.axes)?,
            },
            "jog" => Command::Jog {
                axes: number_map(&raw.axes, "axes")?,
            },
            "extrude" => Command::Extrude {
                amount: number_field(&raw.amount, "amount")?,
            },
            "retract" => Command::Retract {
                amount: number_field(&raw.amount, "amount")?,
            },
            "change_tool" => Command::ChangeTool {
                tool: tool_name(string_field(&raw.tool, "tool")?),
            },
            "feed_rate" => Command::FeedRate {
                factor: number_field(&raw.factor, "factor")?,
            },
            "flow_rate" => Command::FlowRate {
                factor: number_field(&raw.factor, "factor")?,
            },
            "gcode" => Command::Gcode {
                commands: gcode_lines(&raw.commands)?,
            },
            "temperature" => {
                let heater = tool_name(string_field(&raw.heater, "heater")?);
                Command::Temperature {
                    heater,
                    value: number_field(&raw.value, "value")?,
                }
            }
            "temperature_offset" => Command::TemperatureOffset {
                offsets: number_map(&raw.offsets, "offsets")?,
            },
            "z_adjust" => Command::ZAdjust {
                height: number_field(&raw.height, "height")?,
            },
            "upload_request" => Command::UploadRequest {
                id: file_id(&raw.id)?,
                loc: destination(&raw.loc)?,
            },
            "new_folder" => Command::NewFolder {
                folder: string_field(&raw.folder, "folder")?,
                loc: destination(&raw.loc)?,
            },
            "delete" => {
                let path = string_field(&raw.file, "file")?;
                let loc = destination(&raw.loc)?;
                let kind = match string_field(&raw.kind, "type")?.to_lowercase().as_str() {
                    "file" => DeleteKind::File,
                    "folder" => DeleteKind::Folder,
                    _ => return Err(IgnoreReason::InvalidField("type")),
                };
                Command::Delete { path, loc, kind }
            }
            _ => return Err(IgnoreReason::Unknown),
        };
        Ok(command)
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Command::Ignored { .. })
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub command: Option<Command>,
    /// `Some(true)` for `state: "active"`, `Some(false)` for any other state string.
    pub active: Option<bool>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Malformed(String),

    #[error("message is not a JSON object")]
    NotAnObject,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }

        let command = if value.get("cmd").is_some() {
            Command::decode(&value)
        } else {
            None
        };
        let active = value
            .get("state")
            .and_then(Value::as_str)
            .map(|s| s.eq_ignore_ascii_case("active"));

        Ok(Self { command, active })
    }
}
