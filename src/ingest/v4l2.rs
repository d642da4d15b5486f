//! V4L2 frame source.
//!
//! Captures from a local device node (e.g. `/dev/video0`) through memory-mapped
//! buffers. RGB3 is requested; YUYV and MJPG are converted when the device
//! negotiates those instead.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CaptureConfig, CaptureSource, CaptureStats};
use crate::frame::Frame;

pub struct V4l2Source {
    config: CaptureConfig,
    state: Option<DeviceState>,
    negotiated: Negotiated,
    frame_count: u64,
}

/// Geometry and layout the driver actually agreed to.
#[derive(Clone, Copy, Debug)]
struct Negotiated {
    width: u32,
    height: u32,
    format: PixelFormat,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

// The mmap stream is only ever driven from the detection loop thread.
unsafe impl Send for DeviceState {}

const CAPTURE_BUFFERS: u32 = 4;

impl V4l2Source {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            negotiated: Negotiated {
                width: config.width,
                height: config.height,
                format: PixelFormat::Rgb24,
            },
            config,
            state: None,
            frame_count: 0,
        }
    }

    /// Ask for RGB3 at the configured size; keep whatever the driver already
    /// has if it refuses.
    fn negotiate(&self, device: &v4l::Device) -> Result<Negotiated> {
        use v4l::video::Capture;

        let mut wanted = device
            .format()
            .with_context(|| format!("query format of {}", self.config.source))?;
        wanted.width = self.config.width;
        wanted.height = self.config.height;
        wanted.fourcc = v4l::FourCC::new(b"RGB3");

        let active = device.set_format(&wanted).or_else(|err| {
            log::warn!(
                "{}: RGB3 {}x{} refused ({}), keeping current format",
                self.config.source,
                self.config.width,
                self.config.height,
                err
            );
            device.format()
        })?;
        let format = PixelFormat::from_fourcc(&active.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "{} delivers {} frames, which cannot be converted to RGB",
                self.config.source,
                active.fourcc
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "{}: frame rate {} not applied: {}",
                    self.config.source,
                    self.config.target_fps,
                    err
                );
            }
        }

        Ok(Negotiated {
            width: active.width,
            height: active.height,
            format,
        })
    }
}

impl CaptureSource for V4l2Source {
    fn describe(&self) -> String {
        self.config.source.clone()
    }

    fn open(&mut self) -> Result<()> {
        self.state = None;
        let device = v4l::Device::with_path(&self.config.source)
            .with_context(|| format!("open capture device {}", self.config.source))?;
        self.negotiated = self.negotiate(&device)?;

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(
                    device,
                    v4l::buffer::Type::VideoCapture,
                    CAPTURE_BUFFERS,
                )
                .with_context(|| "map capture buffers")
            },
        }
        .try_build()?;
        self.state = Some(state);

        let Negotiated { width, height, format } = self.negotiated;
        log::info!(
            "capture device {} streaming {}x{} {:?}",
            self.config.source,
            width,
            height,
            format
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let Negotiated { width, height, format } = self.negotiated;
        let Some(state) = self.state.as_mut() else {
            return Err(anyhow!("capture device {} is not open", self.config.source));
        };
        let (pixels, width, height) = state.with_stream_mut(|stream| -> Result<_> {
            let (buf, _meta) = stream.next().context("dequeue capture buffer")?;
            normalize_to_rgb(buf, width, height, format)
        })?;

        self.frame_count += 1;
        Frame::new(pixels, width, height, self.frame_count)
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!("capture device {} released", self.config.source);
        }
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            source: self.config.source.clone(),
        }
    }
}
