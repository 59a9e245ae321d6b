pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Printer is not operational")]
    NotOperational,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Where a file lives on the printer side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Local,
    Sdcard,
}

impl Destination {
    /// Map a wire `loc` value. Anything other than `sd` lands in local storage.
    pub fn from_loc(loc: &str) -> Self {
        match loc.to_lowercase().as_str() {
            "sd" => Destination::Sdcard,
            "local" => Destination::Local,
            other => {
                tracing::warn!(
                    component = "dispatcher",
                    loc = %other,
                    "Invalid file destination, using local"
                );
                Destination::Local
            }
        }
    }

    pub fn is_sd(&self) -> bool {
        matches!(self, Destination::Sdcard)
    }
}

/// The controlled printer. State queries return opaque JSON that is forwarded
/// to the cloud as-is.
#[async_trait]
pub trait Printer: Send + Sync + Debug {
    async fn pause(&self) -> Result<(), DeviceError>;

    async fn resume(&self) -> Result<(), DeviceError>;

    async fn cancel(&self) -> Result<(), DeviceError>;

    async fn toggle_pause(&self) -> Result<(), DeviceError>;

    async fn select_file(
        &self,
        path: &str,
        on_sd: bool,
        print_after_select: bool,
    ) -> Result<(), DeviceError>;

    /// Home the given axes, or every axis when `None`.
    async fn home(&self, axes: Option<Vec<String>>) -> Result<(), DeviceError>;

    /// Relative jog, axis name to distance in mm.
    async fn jog(&self, axes: HashMap<String, f64>) -> Result<(), DeviceError>;

    async fn extrude(&self, amount: f64) -> Result<(), DeviceError>;

    async fn change_tool(&self, tool: &str) -> Result<(), DeviceError>;

    async fn feed_rate(&self, factor: f64) -> Result<(), DeviceError>;

    async fn set_temperature(&self, heater: &str, value: f64) -> Result<(), DeviceError>;

    async fn set_temperature_offset(
        &self,
        offsets: HashMap<String, f64>,
    ) -> Result<(), DeviceError>;

    /// Send raw gcode lines.
    async fn commands(&self, commands: Vec<String>) -> Result<(), DeviceError>;

    async fn current_job(&self) -> Result<Value, DeviceError>;

    async fn current_data(&self) -> Result<Value, DeviceError>;

    async fn current_temperatures(&self) -> Result<Value, DeviceError>;

    /// True while printing, paused or pausing.
    async fn has_job(&self) -> bool;

    async fn is_operational(&self) -> bool;
}

/// File storage backend of the printer host.
#[async_trait]
pub trait FileStorage: Send + Sync + Debug {
    /// Store a file, overwriting any existing one. Returns the stored path.
    async fn add_file(
        &self,
        destination: Destination,
        path: &str,
        content: Vec<u8>,
    ) -> Result<String, DeviceError>;

    async fn remove_file(&self, destination: Destination, path: &str) -> Result<(), DeviceError>;

    async fn add_folder(&self, destination: Destination, path: &str) -> Result<(), DeviceError>;

    async fn remove_folder(&self, destination: Destination, path: &str)
        -> Result<(), DeviceError>;

    async fn read_file(&self, destination: Destination, path: &str)
        -> Result<Vec<u8>, DeviceError>;

    /// Recursive listing of every destination.
    async fn list_files(&self) -> Result<Value, DeviceError>;
}
