use anyhow::{anyhow, Context, Result};

/// Pixel layouts a capture device may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// Convert a captured buffer to tightly packed RGB24.
///
/// Returns the pixels with their actual dimensions, which for MJPEG come from
/// the JPEG header rather than the negotiated format.
pub(crate) fn normalize_to_rgb(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<(Vec<u8>, u32, u32)> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = rgb_len(width, height)?;
            if data.len() < expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    data.len()
                ));
            }
            Ok((data[..expected].to_vec(), width, height))
        }
        PixelFormat::Yuyv => Ok((yuyv_to_rgb(data, width, height)?, width, height)),
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory(data).context("decode MJPEG frame")?;
            let rgb = image.into_rgb8();
            let (w, h) = rgb.dimensions();
            Ok((rgb.into_raw(), w, h))
        }
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if data.len() < pixels * 2 {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            pixels * 2,
            data.len()
        ));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    // Each 4-byte macropixel carries two luma samples sharing one chroma pair.
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0] as f32, chunk[1] as f32, chunk[2] as f32, chunk[3] as f32);
        let (u, v) = (u - 128.0, v - 128.0);
        for y in [y0, y1] {
            rgb.push(clamp_to_u8(y + 1.402 * v));
            rgb.push(clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_to_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
