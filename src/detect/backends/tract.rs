#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const INPUT_SIZE: u32 = 640;
const NMS_IOU: f32 = 0.45;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` (or its
/// transpose) with `cx, cy, w, h` in input pixels followed by per-class scores.
/// Class names are read from `<model>.names` or `labels.txt` beside the model,
/// one per line.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    class_names: Vec<String>,
    input_size: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let input_size = INPUT_SIZE;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_size as usize, input_size as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        let class_names = load_class_names(model_path)?;
        if class_names.is_empty() {
            log::warn!(
                "no class names found beside {}; target class lookups will fail",
                model_path.display()
            );
        }

        Ok(Self {
            model,
            class_names,
            input_size,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = frame.to_image()?;
        let resized = imageops::resize(&image, self.input_size, self.input_size, FilterType::Triangle);
        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        // Anchors outnumber attributes for any realistic model.
        let transposed = shape[1] > shape[2];
        let (attrs, anchors) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if attrs <= 4 {
            return Err(anyhow!("model output has no class scores: {:?}", shape));
        }
        let at = |attr: usize, anchor: usize| {
            if transposed {
                view[[0, anchor, attr]]
            } else {
                view[[0, attr, anchor]]
            }
        };

        let sx = frame.width as f32 / self.input_size as f32;
        let sy = frame.height as f32 / self.input_size as f32;
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..attrs)
                .map(|attr| (attr - 4, at(attr, anchor)))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score.is_nan() || score < threshold {
                continue;
            }
            let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
            let bbox = BoundingBox::new(
                ((cx - w / 2.0) * sx).max(0.0),
                ((cy - h / 2.0) * sy).max(0.0),
                ((cx + w / 2.0) * sx).min(frame.width as f32 - 1.0),
                ((cy + h / 2.0) * sy).min(frame.height as f32 - 1.0),
            );
            candidates.push(Detection::new(class_id, score.min(1.0), bbox));
        }

        Ok(non_max_suppression(candidates, NMS_IOU))
    }
}

impl Detector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn detect(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame, threshold)
    }
}

/// Greedy per-class suppression, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>, iou: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for cand in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == cand.class_id && k.bbox.iou(&cand.bbox) > iou);
        if !overlaps {
            kept.push(cand);
        }
    }
    kept
}

fn load_class_names(model_path: &Path) -> Result<Vec<String>> {
    let mut candidates: Vec<PathBuf> = vec![model_path.with_extension("names")];
    if let Some(dir) = model_path.parent() {
        candidates.push(dir.join("labels.txt"));
    }
    for path in candidates {
        if !path.is_file() {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read class names from {}", path.display()))?;
        return Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect());
    }
    Ok(Vec::new())
}
