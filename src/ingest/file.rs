//! Local video file source.
//!
//! Decodes a local file with FFmpeg (feature: ingest-file-ffmpeg). Reaching the
//! end of the file surfaces as a read failure; the detection loop's reopen then
//! restarts playback from the beginning.

use anyhow::{anyhow, Result};
use std::path::Path;
#[cfg(feature = "ingest-file-ffmpeg")]
use std::time::Instant;

use super::{CaptureConfig, CaptureSource, CaptureStats};
use crate::frame::Frame;

#[cfg(feature = "ingest-file-ffmpeg")]
use ffmpeg_next as ffmpeg;

pub struct FileSource {
    config: CaptureConfig,
    #[cfg(feature = "ingest-file-ffmpeg")]
    decoder: Option<FfmpegDecoder>,
    #[cfg(feature = "ingest-file-ffmpeg")]
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

impl FileSource {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        if config.source.contains("://") {
            return Err(anyhow!(
                "file capture only supports local paths, got {}",
                config.source
            ));
        }
        if !Path::new(&config.source).is_file() {
            return Err(anyhow!("capture file {} does not exist", config.source));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            ffmpeg::init().map_err(|err| anyhow!("initialize ffmpeg: {err}"))?;
            Ok(Self {
                config,
                decoder: None,
                last_frame_at: None,
                frame_count: 0,
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "file capture of {} requires the ingest-file-ffmpeg feature",
                config.source
            ))
        }
    }
}

impl CaptureSource for FileSource {
    fn describe(&self) -> String {
        self.config.source.clone()
    }

    fn open(&mut self) -> Result<()> {
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            self.decoder = Some(FfmpegDecoder::open(&self.config.source)?);
            log::info!("FileSource: opened {} (ffmpeg)", self.config.source);
            Ok(())
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!("file capture requires the ingest-file-ffmpeg feature"))
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            super::pace(self.last_frame_at, super::frame_interval(self.config.target_fps));
            let decoder = self
                .decoder
                .as_mut()
                .ok_or_else(|| anyhow!("file source {} is not open", self.config.source))?;
            let (pixels, width, height) = decoder.next_rgb()?;
            self.frame_count += 1;
            self.last_frame_at = Some(Instant::now());
            Frame::new(pixels, width, height, self.frame_count)
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!("file capture requires the ingest-file-ffmpeg feature"))
        }
    }

    fn release(&mut self) {
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            self.decoder = None;
        }
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            self.decoder.is_some()
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            false
        }
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            source: self.config.source.clone(),
        }
    }
}

/// Demuxer, decoder and RGB converter for one open file.
#[cfg(feature = "ingest-file-ffmpeg")]
struct FfmpegDecoder {
    input: ffmpeg::format::context::Input,
    video_stream: usize,
    video: ffmpeg::codec::decoder::Video,
    to_rgb: ffmpeg::software::scaling::Context,
    drained: bool,
}

// The decoder is only ever driven from the detection loop thread.
#[cfg(feature = "ingest-file-ffmpeg")]
unsafe impl Send for FfmpegDecoder {}

#[cfg(feature = "ingest-file-ffmpeg")]
impl FfmpegDecoder {
    fn open(path: &str) -> Result<Self> {
        use anyhow::Context;
        use ffmpeg::software::scaling;

        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("ffmpeg could not open {}", path))?;
        let (video_stream, parameters) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| anyhow!("{} has no video stream", path))?;
            (stream.index(), stream.parameters())
        };
        let video = ffmpeg::codec::context::Context::from_parameters(parameters)
            .and_then(|ctx| ctx.decoder().video())
            .with_context(|| format!("no usable video decoder for {}", path))?;
        let to_rgb = scaling::Context::get(
            video.format(),
            video.width(),
            video.height(),
            ffmpeg::format::Pixel::RGB24,
            video.width(),
            video.height(),
            scaling::Flags::BILINEAR,
        )
        .context("create RGB converter")?;

        Ok(Self {
            input,
            video_stream,
            video,
            to_rgb,
            drained: false,
        })
    }

    /// Decode the next picture. Packets are fed until the decoder yields one;
    /// at end of input the decoder is flushed once so buffered pictures are
    /// not lost.
    fn next_rgb(&mut self) -> Result<(Vec<u8>, u32, u32)> {
        let mut picture = ffmpeg::frame::Video::empty();
        loop {
            if self.video.receive_frame(&mut picture).is_ok() {
                return self.convert(&picture);
            }
            if self.drained {
                return Err(anyhow!("end of file"));
            }
            match self.next_video_packet() {
                Some(packet) => self
                    .video
                    .send_packet(&packet)
                    .map_err(|err| anyhow!("decode packet: {err}"))?,
                None => {
                    self.drained = true;
                    self.video
                        .send_eof()
                        .map_err(|err| anyhow!("flush decoder: {err}"))?;
                }
            }
        }
    }

    fn next_video_packet(&mut self) -> Option<ffmpeg::Packet> {
        let wanted = self.video_stream;
        self.input
            .packets()
            .find(|(stream, _)| stream.index() == wanted)
            .map(|(_, packet)| packet)
    }

    fn convert(&mut self, picture: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.to_rgb
            .run(picture, &mut rgb)
            .map_err(|err| anyhow!("convert picture to RGB: {err}"))?;
        let (width, height) = (rgb.width(), rgb.height());
        let pixels = pack_rows(rgb.data(0), rgb.stride(0), width as usize * 3, height as usize)?;
        Ok((pixels, width, height))
    }
}

/// Copy `rows` rows of `row_bytes` each out of a plane padded to `stride`.
#[cfg_attr(not(feature = "ingest-file-ffmpeg"), allow(dead_code))]
fn pack_rows(plane: &[u8], stride: usize, row_bytes: usize, rows: usize) -> Result<Vec<u8>> {
    if stride < row_bytes {
        return Err(anyhow!("plane stride {stride} shorter than row of {row_bytes} bytes"));
    }
    let pixels: Vec<u8> = plane
        .chunks(stride)
        .take(rows)
        .filter(|row| row.len() >= row_bytes)
        .flat_map(|row| &row[..row_bytes])
        .copied()
        .collect();
    if pixels.len() != row_bytes * rows {
        return Err(anyhow!("decoded plane is truncated"));
    }
    Ok(pixels)
}
