//! Service-wide state shared by the HTTP surface.
//!
//! `ServiceState` owns the handles every request needs: the frame slots, the
//! detection store and the camera status. The detection loop holds clones of
//! the same `Arc`s. Query results are assembled here; HTTP status codes and
//! framing live in `api`.

use anyhow::Result;
use base64::Engine as _;
use serde::Serialize;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::detect::Detector;
use crate::frame::SharedFrameState;
use crate::pipeline::CameraStatus;
use crate::store::DetectionStore;

/// What the service knows about the loaded model.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub loaded: bool,
    pub path: String,
    pub class_names: Vec<String>,
}

impl ModelInfo {
    pub fn from_detector(path: impl Into<String>, detector: &dyn Detector) -> Self {
        Self {
            loaded: true,
            path: path.into(),
            class_names: detector.class_names().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub model_loaded: bool,
    pub model_path: String,
    pub model_class_names_count: usize,
    pub camera_active: bool,
    pub webcam_index: String,
    pub target_class_name: String,
    pub confidence_threshold: f32,
    pub detection_available_single_api: bool,
    pub saved_images_count: usize,
    pub frames_processed: u64,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SavedImagesResponse {
    pub images: Vec<String>,
    pub base_url: String,
}

pub struct ServiceState {
    pub frames: Arc<SharedFrameState>,
    pub store: Arc<DetectionStore>,
    pub camera: Arc<CameraStatus>,
    pub model: ModelInfo,
    capture_source: String,
    target_class: String,
    confidence_threshold: f32,
    jpeg_quality: u8,
    base_url: String,
}

impl ServiceState {
    pub fn new(
        config: &ServiceConfig,
        frames: Arc<SharedFrameState>,
        store: Arc<DetectionStore>,
        camera: Arc<CameraStatus>,
        model: ModelInfo,
    ) -> Self {
        Self {
            frames,
            store,
            camera,
            model,
            capture_source: config.capture.source.clone(),
            target_class: config.detection.target_class.clone(),
            confidence_threshold: config.detection.confidence_threshold,
            jpeg_quality: config.detection.jpeg_quality,
            base_url: config.storage.base_url.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            model_loaded: self.model.loaded,
            model_path: self.model.path.clone(),
            model_class_names_count: self.model.class_names.len(),
            camera_active: self.camera.is_active(),
            webcam_index: self.capture_source.clone(),
            target_class_name: self.target_class.clone(),
            confidence_threshold: self.confidence_threshold,
            detection_available_single_api: self.frames.has_positive(),
            saved_images_count: self.store.len(),
            frames_processed: self.camera.frames_processed(),
        }
    }

    /// Latest positive frame as base64 JPEG. `Ok(None)` when there is none.
    pub fn latest_snapshot(&self) -> Result<Option<String>> {
        let Some(frame) = self.frames.read_positive() else {
            return Ok(None);
        };
        let jpeg = frame.jpeg(self.jpeg_quality)?;
        Ok(Some(base64::engine::general_purpose::STANDARD.encode(jpeg)))
    }

    pub fn snapshot_response(&self) -> Result<SnapshotResponse> {
        Ok(match self.latest_snapshot()? {
            Some(image) => SnapshotResponse {
                image_base64: Some(image),
                message: None,
            },
            None => SnapshotResponse {
                image_base64: None,
                message: Some(format!(
                    "No '{}' detection available for single image API.",
                    self.target_class
                )),
            },
        })
    }

    pub fn saved_images(&self) -> SavedImagesResponse {
        SavedImagesResponse {
            images: self.store.list(),
            base_url: self.base_url.clone(),
        }
    }
}
