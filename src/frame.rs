//! Frame model and the producer/consumer sharing boundary.
//!
//! - `Frame`: immutable-once-published RGB raster. Pixels are private; consumers
//!   read them through `pixels()` or the cached JPEG encoding.
//! - `SharedFrameState`: the single lock between the detection loop and every
//!   consumer. It holds two slots, `annotated` (always replaced) and `positive`
//!   (replaced only on positive iterations), written together under one
//!   critical section.
//!
//! Slots hold `Arc<Frame>`, so a read costs one reference-count increment and
//! never copies pixel data while the lock is held.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Bytes per pixel for the RGB24 layout used throughout the crate.
pub const CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A single RGB24 raster tagged with a sequence number and capture time.
///
/// There is no `&mut` accessor to the pixel buffer: once a frame is built it is
/// never mutated. Annotation produces a new frame via [`Frame::to_image`] and
/// [`Frame::from_image`].
#[derive(Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonically advancing within the producer that stamped it.
    pub sequence: u64,
    /// Wall-clock capture time, milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
    jpeg: OnceLock<Vec<u8>>,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {} RGB bytes for {}x{}, got {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            sequence,
            captured_at_ms: crate::now_ms(),
            jpeg: OnceLock::new(),
        })
    }

    /// Build a frame from an image buffer, keeping the given capture metadata.
    pub fn from_image(image: RgbImage, sequence: u64, captured_at_ms: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
            sequence,
            captured_at_ms,
            jpeg: OnceLock::new(),
        }
    }

    /// Copy the pixels into a mutable image buffer.
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Restamp the sequence number. Only valid before the frame is shared.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// JPEG encoding of this frame, computed at most once.
    ///
    /// The first successful call fixes the encoding; `quality` on later calls
    /// is ignored. Stream clients and the persistence path share the bytes.
    pub fn jpeg(&self, quality: u8) -> Result<&[u8]> {
        if let Some(bytes) = self.jpeg.get() {
            return Ok(bytes);
        }
        let encoded = encode_jpeg(&self.pixels, self.width, self.height, quality)?;
        // A concurrent encoder may have won the race; either result is valid.
        let _ = self.jpeg.set(encoded);
        self.jpeg
            .get()
            .map(|bytes| bytes.as_slice())
            .ok_or_else(|| anyhow!("jpeg cache unexpectedly empty"))
    }
}

pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

// ----------------------------------------------------------------------------
// SharedFrameState
// ----------------------------------------------------------------------------

#[derive(Default)]
struct FrameSlots {
    annotated: Option<Arc<Frame>>,
    positive: Option<PositiveSlot>,
}

struct PositiveSlot {
    frame: Arc<Frame>,
    published_at: Instant,
}

/// One writer (the detection loop), many readers (HTTP handlers).
///
/// Readers may run concurrently with each other; `publish` excludes all of
/// them for the duration of two pointer swaps.
pub struct SharedFrameState {
    slots: RwLock<FrameSlots>,
    positive_ttl: Option<Duration>,
}

impl SharedFrameState {
    /// The positive snapshot is kept until the next positive frame.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(FrameSlots::default()),
            positive_ttl: None,
        }
    }

    /// The positive snapshot expires `ttl` after it was published.
    pub fn with_positive_ttl(ttl: Duration) -> Self {
        Self {
            slots: RwLock::new(FrameSlots::default()),
            positive_ttl: Some(ttl),
        }
    }

    /// Publish a fully annotated frame.
    ///
    /// Replaces the annotated slot. When `positive` is set, the positive slot is
    /// replaced in the same critical section and the frame is handed back so
    /// the caller can persist it after the lock is released.
    pub fn publish(&self, frame: Frame, positive: bool) -> Option<Arc<Frame>> {
        let frame = Arc::new(frame);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.annotated = Some(frame.clone());
        if positive {
            slots.positive = Some(PositiveSlot {
                frame: frame.clone(),
                published_at: Instant::now(),
            });
            Some(frame)
        } else {
            None
        }
    }

    pub fn read_annotated(&self) -> Option<Arc<Frame>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.annotated.clone()
    }

    /// Latest positive frame, or `None` if there is none or it has expired.
    pub fn read_positive(&self) -> Option<Arc<Frame>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.positive.as_ref()?;
        if let Some(ttl) = self.positive_ttl {
            if slot.published_at.elapsed() > ttl {
                return None;
            }
        }
        Some(slot.frame.clone())
    }

    pub fn has_positive(&self) -> bool {
        self.read_positive().is_some()
    }
}

impl Default for SharedFrameState {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
