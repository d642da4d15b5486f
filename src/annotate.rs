//! Frame annotation.
//!
//! Draws a labelled bounding box for every detection of the target class and
//! reports whether the frame is positive. Frames without a match pass through
//! untouched, so no pixel copy is made for negative iterations.

use anyhow::Result;
use image::{Rgb, RgbImage};

use crate::detect::Detection;
use crate::frame::Frame;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: i32 = 2;
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = GLYPH_WIDTH + 1;
/// Distance from the top edge of the box to the top of the label.
const LABEL_OFFSET: i32 = 10;

/// Result of annotating one raw frame.
#[derive(Debug)]
pub struct Annotated {
    pub frame: Frame,
    pub positive: bool,
    /// Number of target-class detections drawn.
    pub matches: usize,
}

pub struct Annotator {
    target_class_id: Option<usize>,
    target_name: String,
}

impl Annotator {
    /// `target_class_id` is `None` when the detector does not know the target
    /// class; every frame is then negative.
    pub fn new(target_class_id: Option<usize>, target_name: impl Into<String>) -> Self {
        Self {
            target_class_id,
            target_name: target_name.into(),
        }
    }

    pub fn annotate(&self, raw: Frame, detections: &[Detection]) -> Result<Annotated> {
        let Some(target) = self.target_class_id else {
            return Ok(Annotated {
                frame: raw,
                positive: false,
                matches: 0,
            });
        };
        let matching: Vec<&Detection> = detections
            .iter()
            .filter(|det| det.class_id == target)
            .collect();
        if matching.is_empty() {
            return Ok(Annotated {
                frame: raw,
                positive: false,
                matches: 0,
            });
        }

        let mut image = raw.to_image()?;
        for det in &matching {
            let (x1, y1) = (det.bbox.x1.round() as i32, det.bbox.y1.round() as i32);
            let (x2, y2) = (det.bbox.x2.round() as i32, det.bbox.y2.round() as i32);
            for inset in 0..BOX_THICKNESS {
                draw_rectangle(&mut image, x1 + inset, y1 + inset, x2 - inset, y2 - inset, BOX_COLOR);
            }

            let label = format!("{} {:.2}", self.target_name, det.confidence);
            let label_y = (y1 - LABEL_OFFSET).max(0);
            let label_w = label.chars().count() as i32 * GLYPH_ADVANCE;
            fill_rect(&mut image, x1, label_y, x1 + label_w, label_y + GLYPH_HEIGHT + 1, BOX_COLOR);
            draw_text(&mut image, x1 + 1, label_y + 1, &label, TEXT_COLOR);
            log::debug!(
                "detected {} ({:.2}) in frame {}",
                self.target_name,
                det.confidence,
                raw.sequence
            );
        }

        Ok(Annotated {
            frame: Frame::from_image(image, raw.sequence, raw.captured_at_ms),
            positive: true,
            matches: matching.len(),
        })
    }
}

fn clamp_to(image: &RgbImage, x: i32, y: i32) -> (i32, i32) {
    let max_x = image.width() as i32 - 1;
    let max_y = image.height() as i32 - 1;
    (x.clamp(0, max_x.max(0)), y.clamp(0, max_y.max(0)))
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if image.width() == 0 || image.height() == 0 || left > right || top > bottom {
        return;
    }
    let (left, top) = clamp_to(image, left, top);
    let (right, bottom) = clamp_to(image, right, bottom);
    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if image.width() == 0 || image.height() == 0 || left > right || top > bottom {
        return;
    }
    let (left, top) = clamp_to(image, left, top);
    let (right, bottom) = clamp_to(image, right, bottom);
    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

/// Render `text` with the built-in 5x7 font. Characters without a glyph
/// advance the cursor but draw nothing.
fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for (index, ch) in text.chars().flat_map(char::to_uppercase).enumerate() {
        let Some(rows) = glyph(ch) else { continue };
        let origin = x + index as i32 * GLYPH_ADVANCE;
        for (row, bits) in rows.iter().enumerate() {
            let py = y + row as i32;
            if py < 0 || py >= height {
                continue;
            }
            for col in 0..GLYPH_WIDTH {
                let px = origin + col;
                if bits >> (GLYPH_WIDTH - 1 - col) & 1 == 1 && px >= 0 && px < width {
                    image.put_pixel(px as u32, py as u32, color);
                }
            }
        }
    }
}

fn glyph(ch: char) -> Option<&'static [u8; 7]> {
    GLYPHS
        .iter()
        .find(|(c, _)| *c == ch)
        .map(|(_, rows)| rows)
}

#[rustfmt::skip]
static GLYPHS: &[(char, [u8; 7])] = &[
    ('A', [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
    ('B', [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110]),
    ('C', [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
    ('D', [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110]),
    ('E', [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111]),
    ('F', [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000]),
    ('G', [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111]),
    ('H', [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
    ('I', [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
    ('J', [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100]),
    ('K', [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001]),
    ('L', [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
    ('M', [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001]),
    ('N', [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001]),
    ('O', [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
    ('P', [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
    ('Q', [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101]),
    ('R', [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001]),
    ('S', [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110]),
    ('T', [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
    ('U', [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
    ('V', [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100]),
    ('W', [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010]),
    ('X', [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001]),
    ('Y', [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100]),
    ('Z', [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111]),
    ('0', [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
    ('1', [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
    ('2', [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
    ('3', [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
    ('4', [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
    ('5', [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
    ('6', [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
    ('7', [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
    ('8', [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
    ('9', [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
    ('.', [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00110, 0b00110]),
    ('-', [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000]),
    ('_', [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111]),
    ('%', [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011]),
];
