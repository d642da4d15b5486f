//! Detection capability.
//!
//! The detection loop only sees the [`Detector`] trait. Concrete backends:
//! - `StubBackend`: scripted results for tests, or a synthetic "bright card"
//!   finder that pairs with the `stub://` capture source.
//! - `TractBackend` (feature `backend-tract`): ONNX YOLO-style model.

mod backend;
mod backends;
mod result;

pub use backend::{load_detector, Detector};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BoundingBox, Detection};
