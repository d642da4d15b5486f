//! watchpost - live detection feed
//!
//! A single capture device feeds a detection loop. The loop publishes every
//! annotated frame into [`SharedFrameState`], which the HTTP surface reads for
//! the multipart stream and the snapshot API. Frames containing the target
//! class are persisted into a bounded on-disk [`DetectionStore`].
//!
//! Ownership is explicit: [`ServiceState`] holds the handles that both sides
//! need, and the detection loop receives clones of the same handles.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod service;
pub mod store;

pub use annotate::{Annotated, Annotator};
pub use config::ServiceConfig;
pub use detect::{load_detector, BoundingBox, Detection, Detector, StubBackend};
pub use frame::{Frame, SharedFrameState};
pub use ingest::{open_source, CaptureSource, CaptureStats, SyntheticSource};
pub use pipeline::{CameraState, CameraStatus, DetectionLoop, IterationOutcome, LoopHandle};
pub use service::{ModelInfo, ServiceState, StatusReport};
pub use store::{DetectionStore, SavedEntry};

/// Milliseconds since the Unix epoch. Clamps to zero if the clock is before 1970.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
