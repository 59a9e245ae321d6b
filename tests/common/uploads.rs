//! Upload endpoints that record calls instead of talking HTTP.

use async_trait::async_trait;
use parking_lot::Mutex;
use printer_cloud_link::cloud::{CloudError, RemoteFile, UploadEndpoints};
use printer_cloud_link::link::FileId;

#[derive(Debug, Default)]
pub struct RecordingUploads {
    calls: Mutex<Vec<String>>,
    images: Mutex<Vec<(String, String, usize)>>,
    gcode: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingUploads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// `(name, camera, byte length)` per posted image.
    pub fn images(&self) -> Vec<(String, String, usize)> {
        self.images.lock().clone()
    }

    pub fn gcode(&self) -> Vec<(String, Vec<u8>)> {
        self.gcode.lock().clone()
    }
}

#[async_trait]
impl UploadEndpoints for RecordingUploads {
    async fn request_upload(&self, file_id: &FileId) -> Result<RemoteFile, CloudError> {
        self.calls.lock().push(format!("request_upload:{}", file_id));
        Ok(RemoteFile {
            name: format!("{}.gcode", file_id),
            content: b"G28\nG1 X10 Y10\n".to_vec(),
        })
    }

    async fn acknowledge_upload(&self, file_id: &FileId) -> Result<(), CloudError> {
        self.calls.lock().push(format!("acknowledge_upload:{}", file_id));
        Ok(())
    }

    async fn post_gcode(&self, name: &str, content: Vec<u8>) -> Result<(), CloudError> {
        self.calls.lock().push(format!("post_gcode:{}", name));
        self.gcode.lock().push((name.to_string(), content));
        Ok(())
    }

    async fn post_image(&self, name: &str, camera: &str, jpeg: Vec<u8>) -> Result<(), CloudError> {
        self.calls.lock().push(format!("post_image:{}", name));
        self.images
            .lock()
            .push((name.to_string(), camera.to_string(), jpeg.len()));
        Ok(())
    }
}
