use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const ENV_BASE_URL: &str = "CLOUD_LINK_BASE_URL";
pub const ENV_TOKEN: &str = "CLOUD_LINK_TOKEN";
pub const ENV_ENABLED: &str = "CLOUD_LINK_ENABLED";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Base URL is not configured")]
    MissingBaseUrl,

    #[error("Auth token is not configured")]
    MissingToken,

    #[error("Invalid base URL {0}: must start with http:// or https://")]
    InvalidUrl(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Cloud link is disabled")]
    Disabled,
}

/// Telemetry cadence for each remote/job combination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PushIntervals {
    pub active_job_ms: u64,
    pub active_idle_ms: u64,
    pub idle_ms: u64,
}

impl Default for PushIntervals {
    fn default() -> Self {
        Self {
            active_job_ms: 400,
            active_idle_ms: 800,
            idle_ms: 30_000,
        }
    }
}

impl PushIntervals {
    pub fn active_job(&self) -> Duration {
        Duration::from_millis(self.active_job_ms)
    }

    pub fn active_idle(&self) -> Duration {
        Duration::from_millis(self.active_idle_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub snapshot_url: String,
    #[serde(default = "default_camera_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_camera_interval() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    pub tick_ms: u64,
    pub cameras: Vec<CameraConfig>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            cameras: vec![CameraConfig {
                snapshot_url: "http://127.0.0.1:8080/?action=snapshot".to_string(),
                interval_secs: default_camera_interval(),
                label: Some("primary".to_string()),
            }],
        }
    }
}

/// Link configuration. Every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub enabled: bool,
    pub base_url: String,
    pub auth_token: Option<String>,
    /// Log the effective configuration, token redacted, at startup.
    pub log_config: bool,
    pub push: PushIntervals,
    pub backoff_max_secs: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub sampler: SamplerConfig,
    pub log_filter: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://cloud.mattalabs.com/".to_string(),
            auth_token: None,
            log_config: false,
            push: PushIntervals::default(),
            backoff_max_secs: 300,
            connect_timeout_ms: 5000,
            request_timeout_ms: 10_000,
            sampler: SamplerConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl LinkConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: LinkConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!(component = "config", path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.auth_token = Some(token);
        }
        if let Some(enabled) = lookup(ENV_ENABLED) {
            match enabled.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.enabled = true,
                "0" | "false" | "no" | "off" => self.enabled = false,
                other => warn!(
                    component = "config",
                    value = %other,
                    "Ignoring unrecognised {}",
                    ENV_ENABLED
                ),
            }
        }
    }

    /// Startup check. A missing token is not an error here; the link simply
    /// stays idle until one is supplied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url();
        if base.is_empty() {
            return Err(ConfigError::MissingBaseUrl);
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(base));
        }

        let nonzero = [
            ("push.active_job_ms", self.push.active_job_ms),
            ("push.active_idle_ms", self.push.active_idle_ms),
            ("push.idle_ms", self.push.idle_ms),
            ("backoff_max_secs", self.backoff_max_secs),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("sampler.tick_ms", self.sampler.tick_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        for camera in &self.sampler.cameras {
            if camera.interval_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "sampler.cameras.interval_secs",
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn token(&self) -> Option<&str> {
        self.auth_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn is_setup_complete(&self) -> bool {
        !self.base_url().is_empty() && self.token().is_some()
    }

    /// Everything needed to open the channel, or why it cannot be opened yet.
    pub fn channel_target(&self) -> Result<(String, String), ConfigError> {
        if !self.enabled {
            return Err(ConfigError::Disabled);
        }
        if self.base_url().is_empty() {
            return Err(ConfigError::MissingBaseUrl);
        }
        let token = self.token().ok_or(ConfigError::MissingToken)?;
        Ok((self.ws_url(), token.to_string()))
    }

    pub fn base_url(&self) -> String {
        self.base_url.trim().trim_end_matches('/').to_string()
    }

    pub fn api_url(&self) -> String {
        format!("{}/api", self.base_url())
    }

    pub fn ws_url(&self) -> String {
        let api = self.api_url();
        let ws = if let Some(rest) = api.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = api.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            api
        };
        format!("{}/ws/printer/", ws)
    }

    pub fn ping_url(&self) -> String {
        format!("{}/ping/", self.api_url())
    }

    pub fn data_url(&self) -> String {
        format!("{}/receive/data/", self.api_url())
    }

    pub fn img_url(&self) -> String {
        format!("{}/receive/img/", self.api_url())
    }

    pub fn gcode_url(&self) -> String {
        format!("{}/receive/gcode/", self.api_url())
    }

    pub fn request_url(&self) -> String {
        format!("{}/receive/request/", self.api_url())
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
