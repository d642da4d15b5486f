//! Capture sources.
//!
//! Every source implements [`CaptureSource`]: the detection loop opens it once
//! at startup, pulls frames one at a time, and on a read failure releases and
//! reopens it. Sources:
//! - `stub://...`: synthetic scene with a periodic bright "card" (always built)
//! - device index (`0`, `1`, ...) or `/dev/videoN` (feature: ingest-v4l2)
//! - `http(s)://` MJPEG or single-JPEG camera endpoints (feature: ingest-http)
//! - local video file path (feature: ingest-file-ffmpeg)
//!
//! Sources never write frames to disk; persistence belongs to the detection store.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::frame::Frame;

pub mod file;
#[cfg(feature = "ingest-http")]
pub mod http;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use file::FileSource;
#[cfg(feature = "ingest-http")]
pub use http::MjpegSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Settings shared by all capture sources.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Capture identifier: device index, device path, file path, URL or `stub://`.
    pub source: String,
    /// Preferred frame width (devices may negotiate something else).
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    /// Target frame rate. Sources pace or decimate to this rate; 0 means unpaced.
    pub target_fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 15,
        }
    }
}

/// A video device, file or stream that produces frames on demand.
pub trait CaptureSource: Send {
    /// Human-readable identifier for logs and status.
    fn describe(&self) -> String;

    /// Open (or reopen) the underlying device.
    fn open(&mut self) -> Result<()>;

    /// Read the next raw frame.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release the underlying device. Safe to call when already released.
    fn release(&mut self);

    fn is_open(&self) -> bool;

    fn stats(&self) -> CaptureStats;
}

/// Statistics for a capture source.
#[derive(Clone, Debug)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Resolve a capture identifier to a source. The source is not opened yet.
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
    let id = config.source.trim();
    if id.is_empty() {
        return Err(anyhow!("capture source must not be empty"));
    }
    if id.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }
    if id.starts_with("http://") || id.starts_with("https://") {
        #[cfg(feature = "ingest-http")]
        {
            return Ok(Box::new(MjpegSource::new(config.clone())?));
        }
        #[cfg(not(feature = "ingest-http"))]
        {
            return Err(anyhow!("{} requires the ingest-http feature", id));
        }
    }
    if let Some(device) = device_path(id) {
        #[cfg(feature = "ingest-v4l2")]
        {
            let mut device_config = config.clone();
            device_config.source = device;
            return Ok(Box::new(V4l2Source::new(device_config)));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!(
                "capture device {} requires the ingest-v4l2 feature",
                device
            ));
        }
    }
    Ok(Box::new(FileSource::new(config.clone())?))
}

/// Map a numeric index or `/dev/video*` path to a device node path.
fn device_path(id: &str) -> Option<String> {
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("/dev/video{}", id));
    }
    if id.starts_with("/dev/video") {
        return Some(id.to_string());
    }
    None
}

/// Minimum spacing between frames for a target rate.
pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

/// Sleep until at least `interval` has passed since `last`.
pub(crate) fn pace(last: Option<Instant>, interval: Duration) {
    if let Some(last) = last {
        let elapsed = last.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
}
