//! Synthetic frame source for `stub://` identifiers.
//!
//! Produces a drifting gradient background. For one third of every 90-frame
//! cycle a solid white "card" slides across the scene, which the synthetic
//! stub detector reports as class 0.

use anyhow::{anyhow, Result};
use std::time::Instant;

use super::{frame_interval, pace, CaptureConfig, CaptureSource, CaptureStats};
use crate::frame::{Frame, CHANNELS};

const CYCLE_FRAMES: u64 = 90;

pub struct SyntheticSource {
    config: CaptureConfig,
    open: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            open: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    /// Whether the frame with this count shows the card.
    pub fn card_visible(frame_count: u64) -> bool {
        frame_count % CYCLE_FRAMES >= CYCLE_FRAMES * 2 / 3
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut pixels = vec![0u8; width * height * CHANNELS];

        for (i, px) in pixels.chunks_exact_mut(CHANNELS).enumerate() {
            let (x, y) = (i % width, i / width);
            // Background stays well below the card brightness level.
            let shade = ((x + y + self.frame_count as usize) % 160) as u8;
            px.copy_from_slice(&[shade / 2, shade / 2 + 20, shade]);
        }

        if Self::card_visible(self.frame_count) {
            let card_w = (width / 4).max(1);
            let card_h = (height / 5).max(1);
            let phase = (self.frame_count % CYCLE_FRAMES) as usize;
            let travel = width.saturating_sub(card_w);
            let x0 = travel * phase / CYCLE_FRAMES as usize;
            let y0 = height.saturating_sub(card_h) / 2;
            for y in y0..y0 + card_h {
                let row = y * width;
                for x in x0..(x0 + card_w).min(width) {
                    let i = (row + x) * CHANNELS;
                    pixels[i..i + CHANNELS].copy_from_slice(&[255, 255, 255]);
                }
            }
        }

        pixels
    }
}

impl CaptureSource for SyntheticSource {
    fn describe(&self) -> String {
        self.config.source.clone()
    }

    /// Opens unless the configured frame size is empty.
    fn open(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(anyhow!(
                "synthetic source {} needs a non-empty frame size, got {}x{}",
                self.config.source,
                self.config.width,
                self.config.height
            ));
        }
        self.open = true;
        log::info!("SyntheticSource: opened {}", self.config.source);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!("synthetic source {} is not open", self.config.source));
        }
        pace(self.last_frame_at, frame_interval(self.config.target_fps));
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        let pixels = self.generate_pixels();
        Frame::new(pixels, self.config.width, self.config.height, self.frame_count)
    }

    fn release(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            source: self.config.source.clone(),
        }
    }
}
