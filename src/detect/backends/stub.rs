use anyhow::Result;
use std::collections::VecDeque;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::{Frame, CHANNELS};

/// Channel value at or above which a pixel counts as part of a "card".
const BRIGHT_LEVEL: u8 = 250;
/// Minimum bright pixel count before the synthetic finder reports anything.
const MIN_BRIGHT_PIXELS: usize = 64;

/// Stub backend for testing and demo runs.
///
/// - Scripted mode replays one result per `detect` call, then returns nothing.
/// - Synthetic mode reports class 0 around the near-white region of the frame,
///   which is what the `stub://` capture source draws for its simulated card.
pub struct StubBackend {
    class_names: Vec<String>,
    mode: StubMode,
}

enum StubMode {
    Scripted(VecDeque<Vec<Detection>>),
    Synthetic,
}

impl StubBackend {
    pub fn scripted(class_names: Vec<String>, script: Vec<Vec<Detection>>) -> Self {
        Self {
            class_names,
            mode: StubMode::Scripted(script.into()),
        }
    }

    pub fn synthetic(class_names: Vec<String>) -> Self {
        Self {
            class_names,
            mode: StubMode::Synthetic,
        }
    }

    pub fn synthetic_default() -> Self {
        Self::synthetic(vec!["with_card".to_string(), "without_card".to_string()])
    }

    fn find_bright_region(frame: &Frame) -> Option<Detection> {
        let width = frame.width as usize;
        let mut count = 0usize;
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);

        for (i, px) in frame.pixels().chunks_exact(CHANNELS).enumerate() {
            if px.iter().all(|&c| c >= BRIGHT_LEVEL) {
                let (x, y) = (i % width, i / width);
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
                count += 1;
            }
        }
        if count < MIN_BRIGHT_PIXELS {
            return None;
        }

        let box_area = ((max_x - min_x + 1) * (max_y - min_y + 1)) as f32;
        // Fill ratio of the bounding box: a solid card scores close to 1.
        let confidence = (count as f32 / box_area).clamp(0.0, 1.0);
        Some(Detection::new(
            0,
            confidence,
            BoundingBox::new(min_x as f32, min_y as f32, max_x as f32, max_y as f32),
        ))
    }
}

impl Detector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn detect(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        let detections = match &mut self.mode {
            StubMode::Scripted(script) => script.pop_front().unwrap_or_default(),
            StubMode::Synthetic => Self::find_bright_region(frame).into_iter().collect(),
        };
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= threshold)
            .collect())
    }
}
