//! HTTP camera source.
//!
//! Reads `multipart/x-mixed-replace` MJPEG streams, or polls a single-JPEG
//! snapshot endpoint when the response is not multipart.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Instant;
use url::Url;

use super::{frame_interval, pace, CaptureConfig, CaptureSource, CaptureStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 4 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

pub struct MjpegSource {
    config: CaptureConfig,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Multipart(JpegScanner),
    Snapshot,
}

impl MjpegSource {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let url = Url::parse(&config.source)
            .with_context(|| format!("invalid camera url {}", config.source))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("unsupported camera url scheme '{}'", other)),
        }
        if url.host_str().is_none() {
            return Err(anyhow!("camera url {} has no host", config.source));
        }
        Ok(Self {
            config,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
        })
    }
}

impl CaptureSource for MjpegSource {
    fn describe(&self) -> String {
        self.config.source.clone()
    }

    fn open(&mut self) -> Result<()> {
        let response = ureq::get(&self.config.source)
            .call()
            .with_context(|| format!("connect to camera stream {}", self.config.source))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        self.stream = if content_type.contains("multipart") {
            Some(HttpStream::Multipart(JpegScanner::new(response.into_reader())))
        } else {
            Some(HttpStream::Snapshot)
        };
        log::info!(
            "MjpegSource: opened {} ({})",
            self.config.source,
            if content_type.is_empty() { "no content type" } else { &content_type }
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("camera stream {} is not open", self.config.source))?;
        let jpeg = match stream {
            HttpStream::Multipart(scanner) => scanner.next_jpeg()?,
            HttpStream::Snapshot => {
                pace(self.last_frame_at, frame_interval(self.config.target_fps));
                fetch_snapshot(&self.config.source)?
            }
        };

        let image = image::load_from_memory(&jpeg).context("decode camera jpeg")?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Frame::from_image(
            image.into_rgb8(),
            self.frame_count,
            crate::now_ms(),
        ))
    }

    fn release(&mut self) {
        self.stream = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            source: self.config.source.clone(),
        }
    }
}

/// Pulls complete JPEG images out of a byte stream by their SOI/EOI markers,
/// ignoring multipart boundaries and headers in between.
struct JpegScanner {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl JpegScanner {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(jpeg);
            }

            let read = self.reader.read(&mut chunk).context("read camera stream")?;
            if read == 0 {
                return Err(anyhow!("camera stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // Keep the tail in case it holds the start of a marker.
                let drop = self.buffer.len() - 2;
                self.buffer.drain(..drop);
            }
        }
    }
}

fn fetch_snapshot(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot from {}", url));
    }
    Ok(bytes)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
