use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{ApiConfig, StreamSettings, DEFAULT_MAX_CONNECTIONS};
use crate::frame::SharedFrameState;
use crate::ingest::CaptureConfig;
use crate::pipeline::PipelineConfig;
use crate::store::DetectionStore;

#[cfg(feature = "ingest-v4l2")]
const DEFAULT_CAPTURE_SOURCE: &str = "0";
#[cfg(not(feature = "ingest-v4l2"))]
const DEFAULT_CAPTURE_SOURCE: &str = "stub://camera";
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_CAPTURE_FPS: u32 = 15;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
const DEFAULT_MODEL_PATH: &str = "stub://model";
const DEFAULT_TARGET_CLASS: &str = "with_card";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_IDLE_MS: u64 = 10;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_STORAGE_DIR: &str = "saved_detections";
const DEFAULT_MAX_IMAGES: usize = 20;
const DEFAULT_BASE_URL: &str = "/saved_detections/";
const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_STREAM_POLL_MS: u64 = 100;
const DEFAULT_STREAM_KEEPALIVE_MS: u64 = 1000;

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    capture: Option<CaptureConfigFile>,
    model: Option<ModelConfigFile>,
    detection: Option<DetectionConfigFile>,
    storage: Option<StorageConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    target_class: Option<String>,
    confidence_threshold: Option<f32>,
    positive_ttl_secs: Option<u64>,
    idle_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    dir: Option<PathBuf>,
    max_images: Option<usize>,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    stream_poll_ms: Option<u64>,
    stream_keepalive_ms: Option<u64>,
    max_connections: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub capture: CaptureConfig,
    pub reconnect_delay: Duration,
    pub model_path: String,
    pub detection: DetectionSettings,
    pub storage: StorageSettings,
    pub api: ApiConfig,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub target_class: String,
    pub confidence_threshold: f32,
    /// `None` keeps the last positive snapshot until the next positive frame.
    pub positive_ttl: Option<Duration>,
    pub idle: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub dir: PathBuf,
    pub max_images: usize,
    /// URL prefix under which saved images are served.
    pub base_url: String,
}

impl ServiceConfig {
    /// Load from the file named by `WATCHPOST_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let api = file.api.unwrap_or_default();
        let jpeg_quality = detection.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY);

        Self {
            capture: CaptureConfig {
                source: capture
                    .source
                    .unwrap_or_else(|| DEFAULT_CAPTURE_SOURCE.to_string()),
                width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                target_fps: capture.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
            },
            reconnect_delay: Duration::from_millis(
                capture
                    .reconnect_delay_ms
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
            model_path: model
                .path
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
            detection: DetectionSettings {
                target_class: detection
                    .target_class
                    .unwrap_or_else(|| DEFAULT_TARGET_CLASS.to_string()),
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE),
                positive_ttl: detection.positive_ttl_secs.map(Duration::from_secs),
                idle: Duration::from_millis(detection.idle_ms.unwrap_or(DEFAULT_IDLE_MS)),
                jpeg_quality,
            },
            storage: StorageSettings {
                dir: storage
                    .dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
                max_images: storage.max_images.unwrap_or(DEFAULT_MAX_IMAGES),
                base_url: storage
                    .base_url
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            },
            api: ApiConfig {
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
                stream: StreamSettings {
                    poll_interval: Duration::from_millis(
                        api.stream_poll_ms.unwrap_or(DEFAULT_STREAM_POLL_MS),
                    ),
                    keepalive: Duration::from_millis(
                        api.stream_keepalive_ms
                            .unwrap_or(DEFAULT_STREAM_KEEPALIVE_MS),
                    ),
                    jpeg_quality,
                },
                max_connections: api.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = env_string("WATCHPOST_CAPTURE_SOURCE") {
            self.capture.source = source;
        }
        if let Some(path) = env_string("WATCHPOST_MODEL_PATH") {
            self.model_path = path;
        }
        if let Some(class) = env_string("WATCHPOST_TARGET_CLASS") {
            self.detection.target_class = class;
        }
        if let Some(value) = env_string("WATCHPOST_CONFIDENCE") {
            self.detection.confidence_threshold = value
                .parse()
                .map_err(|_| anyhow!("WATCHPOST_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Some(dir) = env_string("WATCHPOST_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Some(value) = env_string("WATCHPOST_MAX_IMAGES") {
            self.storage.max_images = value
                .parse()
                .map_err(|_| anyhow!("WATCHPOST_MAX_IMAGES must be a positive integer"))?;
        }
        if let Some(addr) = env_string("WATCHPOST_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(value) = env_string("WATCHPOST_POSITIVE_TTL_SECS") {
            let seconds: u64 = value.parse().map_err(|_| {
                anyhow!("WATCHPOST_POSITIVE_TTL_SECS must be an integer number of seconds")
            })?;
            self.detection.positive_ttl = Some(Duration::from_secs(seconds));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture.source.trim().is_empty() {
            return Err(anyhow!("capture source must not be empty"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!(
                "capture width and height must be greater than zero, got {}x{}",
                self.capture.width,
                self.capture.height
            ));
        }
        if self.model_path.trim().is_empty() {
            return Err(anyhow!("model path must not be empty"));
        }
        if self.detection.target_class.trim().is_empty() {
            return Err(anyhow!("target class must not be empty"));
        }
        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if !(1..=100).contains(&self.detection.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        if self.storage.max_images == 0 {
            return Err(anyhow!("max_images must be at least 1"));
        }
        let base_url = &self.storage.base_url;
        if !base_url.starts_with('/') || !base_url.ends_with('/') {
            return Err(anyhow!(
                "storage base_url must start and end with '/', got '{}'",
                base_url
            ));
        }
        if base_url.len() < 2 {
            return Err(anyhow!("storage base_url must not be the site root"));
        }
        if self.api.max_connections == 0 {
            return Err(anyhow!("api max_connections must be at least 1"));
        }
        if self.api.stream.poll_interval.is_zero() {
            return Err(anyhow!("stream poll interval must be greater than zero"));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            target_class: self.detection.target_class.clone(),
            confidence_threshold: self.detection.confidence_threshold,
            idle: self.detection.idle,
            reconnect_delay: self.reconnect_delay,
            jpeg_quality: self.detection.jpeg_quality,
        }
    }

    pub fn frame_state(&self) -> SharedFrameState {
        match self.detection.positive_ttl {
            Some(ttl) => SharedFrameState::with_positive_ttl(ttl),
            None => SharedFrameState::new(),
        }
    }

    pub fn detection_store(&self) -> DetectionStore {
        DetectionStore::new(
            &self.storage.dir,
            self.storage.max_images,
            self.detection.jpeg_quality,
        )
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
