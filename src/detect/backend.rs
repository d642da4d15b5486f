use anyhow::{anyhow, Result};
use std::path::Path;

use crate::detect::backends::StubBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector capability injected into the detection loop.
///
/// Implementations treat the frame as read-only and must not retain it past
/// the `detect` call.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class names indexed by class id.
    fn class_names(&self) -> &[String];

    /// Run detection on a frame.
    ///
    /// Only detections with `confidence >= threshold` are returned; callers do
    /// no further filtering.
    fn detect(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Resolve a class name to its id.
    fn class_id(&self, name: &str) -> Option<usize> {
        self.class_names().iter().position(|n| n == name)
    }
}

/// Load the detector named by `model_path`.
///
/// - `stub://` or `stub://a,b,c` selects the synthetic stub with the listed
///   class names (default `with_card,without_card`).
/// - Anything else is a local ONNX file; requires the `backend-tract` feature.
///
/// A missing or unloadable model is a startup error.
pub fn load_detector(model_path: &str) -> Result<Box<dyn Detector>> {
    if let Some(spec) = model_path.strip_prefix("stub://") {
        let classes: Vec<String> = spec
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != "model")
            .map(str::to_string)
            .collect();
        let backend = if classes.is_empty() {
            StubBackend::synthetic_default()
        } else {
            StubBackend::synthetic(classes)
        };
        return Ok(Box::new(backend));
    }

    let path = Path::new(model_path);
    if !path.is_file() {
        return Err(anyhow!("model file not found at {}", path.display()));
    }

    #[cfg(feature = "backend-tract")]
    {
        let backend = crate::detect::backends::TractBackend::new(path)?;
        Ok(Box::new(backend))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(anyhow!(
            "loading {} requires the backend-tract feature",
            path.display()
        ))
    }
}
