use super::message::{Command, DeleteKind, FileId};
use crate::cloud::{CloudError, UploadEndpoints};
use crate::devices::{Destination, DeviceError, FileStorage, Printer};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Routes decoded commands to the printer, storage, and upload endpoints.
///
/// Each command maps to exactly one collaborator operation (the upload
/// handshake is a fixed three-step sequence). Nothing is retried and failures
/// are returned to the caller unlogged.
pub struct CommandDispatcher {
    printer: Arc<dyn Printer>,
    storage: Arc<dyn FileStorage>,
    uploads: Arc<dyn UploadEndpoints>,
}

impl CommandDispatcher {
    pub fn new(
        printer: Arc<dyn Printer>,
        storage: Arc<dyn FileStorage>,
        uploads: Arc<dyn UploadEndpoints>,
    ) -> Self {
        Self {
            printer,
            storage,
            uploads,
        }
    }

    pub fn printer(&self) -> &Arc<dyn Printer> {
        &self.printer
    }

    pub fn storage(&self) -> &Arc<dyn FileStorage> {
        &self.storage
    }

    pub fn uploads(&self) -> &Arc<dyn UploadEndpoints> {
        &self.uploads
    }

    pub async fn dispatch(&self, command: Command) -> Result<(), DispatchError> {
        debug!(component = "dispatcher", command = ?command, "Dispatching command");

        match command {
            Command::Pause => self.printer.pause().await?,
            Command::Resume => self.printer.resume().await?,
            Command::Cancel => self.printer.cancel().await?,
            Command::Toggle => self.printer.toggle_pause().await?,
            Command::Print { file, loc } => {
                self.printer.select_file(&file, loc.is_sd(), true).await?
            }
            Command::Select { file, loc } => {
                self.printer.select_file(&file, loc.is_sd(), false).await?
            }
            Command::Home { axes } => self.printer.home(axes).await?,
            Command::Jog { axes } => self.printer.jog(axes).await?,
            Command::Extrude { amount } => self.printer.extrude(amount).await?,
            Command::Retract { amount } => self.printer.extrude(-amount).await?,
            Command::ChangeTool { tool } => self.printer.change_tool(&tool).await?,
            Command::FeedRate { factor } => self.printer.feed_rate(factor).await?,
            Command::FlowRate { factor } => {
                self.printer
                    .commands(vec![format!("M221 S{}", factor), "M221".to_string()])
                    .await?
            }
            Command::Gcode { commands } => self.printer.commands(commands).await?,
            Command::Temperature { heater, value } => {
                self.printer.set_temperature(&heater, value).await?
            }
            Command::TemperatureOffset { offsets } => {
                self.printer.set_temperature_offset(offsets).await?
            }
            Command::ZAdjust { height } => {
                self.printer
                    .commands(vec![format!("M206 Z{}", height)])
                    .await?
            }
            Command::UploadRequest { id, loc } => self.receive_upload(&id, loc).await?,
            Command::NewFolder { folder, loc } => self.storage.add_folder(loc, &folder).await?,
            Command::Delete { path, loc, kind } => match kind {
                DeleteKind::File => self.storage.remove_file(loc, &path).await?,
                DeleteKind::Folder => self.storage.remove_folder(loc, &path).await?,
            },
            Command::Ignored { cmd, reason } => {
                warn!(component = "dispatcher", cmd = %cmd, "Ignoring command: {}", reason);
            }
        }
        Ok(())
    }

    async fn receive_upload(
        &self,
        file_id: &FileId,
        loc: Destination,
    ) -> Result<(), DispatchError> {
        let file = self.uploads.request_upload(file_id).await?;
        let stored = self.storage.add_file(loc, &file.name, file.content).await?;
        self.uploads.acknowledge_upload(file_id).await?;
        info!(component = "dispatcher", file_id = %file_id, path = %stored, "Upload stored");
        Ok(())
    }
}
