/// Axis-aligned box in frame pixel coordinates (`x1,y1` top-left, `x2,y2` bottom-right).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detector hit. Lives for a single loop iteration and is never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_id: usize, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
        }
    }
}
