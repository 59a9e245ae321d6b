use crate::config::LinkConfig;
use crate::link::message::{wire_timestamp, FileId};
use crate::logging::redact_token;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TOKEN_EMPTY: &str = "Please enter a token.";
pub const TOKEN_VALID: &str = "All is tickety boo! Your token is valid.";
pub const TOKEN_INVALID: &str = "Whoopsie. That token is invalid.";
pub const TOKEN_UNKNOWN: &str = "Oh no! An unknown error occurred.";
pub const TOKEN_OFFLINE: &str = "Error. Please check the printer host's internet connection";

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Cloud link is not set up (missing base URL or token)")]
    NotReady,

    #[error("{method} {url} failed: {source}")]
    Request {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned {status}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A file handed over by the cloud in response to an upload request.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub name: String,
    pub content: Vec<u8>,
}

/// Result of checking an auth token against the ping endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenCheck {
    pub valid: bool,
    pub message: String,
}

/// One-shot request/response endpoints. Calls are never retried; callers log
/// failures and carry on.
#[async_trait]
pub trait UploadEndpoints: Send + Sync {
    /// Announce readiness for `file_id` and receive the file.
    async fn request_upload(&self, file_id: &FileId) -> Result<RemoteFile, CloudError>;

    /// Confirm that `file_id` was stored.
    async fn acknowledge_upload(&self, file_id: &FileId) -> Result<(), CloudError>;

    async fn post_gcode(&self, name: &str, content: Vec<u8>) -> Result<(), CloudError>;

    async fn post_image(&self, name: &str, camera: &str, jpeg: Vec<u8>) -> Result<(), CloudError>;
}

#[derive(Debug, Serialize)]
struct UploadStatus<'a> {
    timestamp: String,
    status: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    file_id: &'a FileId,
}

impl<'a> UploadStatus<'a> {
    fn new(status: &'a str, file_id: &'a FileId) -> Self {
        Self {
            timestamp: wire_timestamp(Utc::now()),
            status,
            kind: "file",
            file_id,
        }
    }
}

/// Client with the given request timeout. A builder failure falls back to the
/// default client, which has no timeout, and says so.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(
                component = "cloud",
                timeout_ms = timeout.as_millis() as u64,
                "HTTP client setup failed, continuing without a request timeout: {}",
                e
            );
            reqwest::Client::new()
        }
    }
}

/// HTTP client for the cloud's REST endpoints.
#[derive(Debug, Clone)]
pub struct CloudApi {
    http_client: reqwest::Client,
    config: LinkConfig,
}

impl CloudApi {
    pub fn new(config: LinkConfig) -> Self {
        let http_client = http_client(config.request_timeout());

        Self {
            http_client,
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn auth_value(token: &str) -> String {
        format!("Token {}", token)
    }

    fn ready_token(&self) -> Result<&str, CloudError> {
        if !self.config.is_setup_complete() {
            warn!(component = "cloud", "Printer not ready, skipping request");
            return Err(CloudError::NotReady);
        }
        self.config.token().ok_or(CloudError::NotReady)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        method: Method,
        url: &str,
        token: &str,
    ) -> Result<reqwest::Response, CloudError> {
        let response = request.send().await.map_err(|source| {
            warn!(
                component = "cloud",
                method = %method,
                url = %url,
                auth = %redact_token(token),
                "Request failed: {}",
                source
            );
            CloudError::Request {
                method: method.clone(),
                url: url.to_string(),
                source,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                component = "cloud",
                method = %method,
                url = %url,
                auth = %redact_token(token),
                status = status.as_u16(),
                "Request rejected"
            );
            return Err(CloudError::Status {
                method,
                url: url.to_string(),
                status,
            });
        }
        debug!(
            component = "cloud",
            method = %method,
            url = %url,
            status = status.as_u16(),
            "Request succeeded"
        );
        Ok(response)
    }

    async fn post_upload_status(
        &self,
        status: &str,
        file_id: &FileId,
    ) -> Result<reqwest::Response, CloudError> {
        let token = self.ready_token()?;
        let url = self.config.request_url();
        let request = self
            .http_client
            .post(&url)
            .header("Authorization", Self::auth_value(token))
            .json(&UploadStatus::new(status, file_id));
        self.execute(request, Method::POST, &url, token).await
    }

    /// Check `token` against the ping endpoint. Never fails; the outcome is
    /// described in the returned message.
    pub async fn test_auth_token(&self, token: &str) -> TokenCheck {
        let token = token.trim();
        if token.is_empty() {
            return TokenCheck {
                valid: false,
                message: TOKEN_EMPTY.to_string(),
            };
        }

        let url = self.config.ping_url();
        let result = self
            .http_client
            .get(&url)
            .header("Authorization", Self::auth_value(token))
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                let message = match status {
                    StatusCode::OK => TOKEN_VALID,
                    StatusCode::UNAUTHORIZED => TOKEN_INVALID,
                    _ => TOKEN_UNKNOWN,
                };
                info!(component = "cloud", status = status.as_u16(), "Token check finished");
                TokenCheck {
                    valid: status.is_success(),
                    message: message.to_string(),
                }
            }
            Err(e) => {
                warn!(
                    component = "cloud",
                    method = "GET",
                    url = %url,
                    auth = %redact_token(token),
                    "Testing authorization token failed: {}",
                    e
                );
                TokenCheck {
                    valid: false,
                    message: TOKEN_OFFLINE.to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl UploadEndpoints for CloudApi {
    async fn request_upload(&self, file_id: &FileId) -> Result<RemoteFile, CloudError> {
        let response = self.post_upload_status("ready", file_id).await?;
        let name = attachment_filename(response.headers()).ok_or_else(|| {
            CloudError::InvalidResponse("missing Content-Disposition filename".to_string())
        })?;
        let body = response.text().await.map_err(|e| {
            CloudError::InvalidResponse(format!("failed to read upload body: {}", e))
        })?;

        info!(component = "cloud", file_id = %file_id, name = %name, "Received upload");
        Ok(RemoteFile {
            name,
            content: unescape_newlines(&body).into_bytes(),
        })
    }

    async fn acknowledge_upload(&self, file_id: &FileId) -> Result<(), CloudError> {
        self.post_upload_status("success", file_id).await?;
        Ok(())
    }

    async fn post_gcode(&self, name: &str, content: Vec<u8>) -> Result<(), CloudError> {
        let token = self.ready_token()?;
        let url = self.config.gcode_url();
        let part = Part::bytes(content)
            .file_name(name.to_string())
            .mime_str("text/plain")
            .map_err(|source| CloudError::Request {
                method: Method::POST,
                url: url.clone(),
                source,
            })?;
        let form = Form::new()
            .part("gcode", part)
            .text("timestamp", wire_timestamp(Utc::now()));

        let request = self
            .http_client
            .post(&url)
            .header("Authorization", Self::auth_value(token))
            .multipart(form);
        self.execute(request, Method::POST, &url, token).await?;
        info!(component = "cloud", name = %name, "Posted gcode");
        Ok(())
    }

    async fn post_image(&self, name: &str, camera: &str, jpeg: Vec<u8>) -> Result<(), CloudError> {
        let token = self.ready_token()?;
        let url = self.config.img_url();
        let part = Part::bytes(jpeg)
            .file_name(name.to_string())
            .mime_str("image/jpeg")
            .map_err(|source| CloudError::Request {
                method: Method::POST,
                url: url.clone(),
                source,
            })?;
        let form = Form::new()
            .part("img", part)
            .text("timestamp", wire_timestamp(Utc::now()))
            .text("camera", camera.to_string());

        let request = self
            .http_client
            .post(&url)
            .header("Authorization", Self::auth_value(token))
            .multipart(form);
        self.execute(request, Method::POST, &url, token).await?;
        debug!(component = "cloud", name = %name, camera = %camera, "Posted image");
        Ok(())
    }
}

/// `filename` parameter of a `Content-Disposition` header.
fn attachment_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    value
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

/// The cloud ships gcode with newlines escaped as the two characters `\n`.
fn unescape_newlines(body: &str) -> String {
    body.replace("\\n", "\n")
}
