//! Detection processing loop.
//!
//! One background thread owns the capture source and the detector. Each
//! iteration reads a frame, runs detection, annotates target-class hits and
//! publishes the result into [`SharedFrameState`]. Positive frames are then
//! encoded and persisted outside the frame lock.
//!
//! Capture failure policy: a failed read releases the source, waits
//! `reconnect_delay` and reopens it once. If that reopen fails the loop halts
//! and the camera is reported as stopped.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::annotate::Annotator;
use crate::detect::Detector;
use crate::frame::{Frame, SharedFrameState};
use crate::ingest::CaptureSource;
use crate::store::DetectionStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraState {
    Stopped,
    Running,
}

/// Camera liveness shared between the loop and every consumer.
#[derive(Debug, Default)]
pub struct CameraStatus {
    active: AtomicBool,
    frames_processed: AtomicU64,
}

impl CameraStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CameraState {
        if self.is_active() {
            CameraState::Running
        } else {
            CameraState::Stopped
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set(&self, state: CameraState) {
        self.active
            .store(state == CameraState::Running, Ordering::Release);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    fn record_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub target_class: String,
    pub confidence_threshold: f32,
    /// Sleep between iterations; zero disables it.
    pub idle: Duration,
    pub reconnect_delay: Duration,
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_class: "with_card".to_string(),
            confidence_threshold: 0.5,
            idle: Duration::from_millis(10),
            reconnect_delay: Duration::from_secs(1),
            jpeg_quality: 85,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    /// A frame was read and published.
    Processed { positive: bool },
    /// A read failed and the source was reopened; no frame was published.
    Reconnected,
    /// A read failed and the reopen failed too. The camera is stopped.
    Halted,
}

pub struct DetectionLoop {
    source: Box<dyn CaptureSource>,
    detector: Box<dyn Detector>,
    annotator: Annotator,
    frames: Arc<SharedFrameState>,
    store: Arc<DetectionStore>,
    camera: Arc<CameraStatus>,
    config: PipelineConfig,
    sequence: u64,
}

impl DetectionLoop {
    pub fn new(
        source: Box<dyn CaptureSource>,
        detector: Box<dyn Detector>,
        frames: Arc<SharedFrameState>,
        store: Arc<DetectionStore>,
        camera: Arc<CameraStatus>,
        config: PipelineConfig,
    ) -> Self {
        let target_id = detector.class_id(&config.target_class);
        match target_id {
            Some(id) => log::info!(
                "target class '{}' resolved to id {} ({} backend)",
                config.target_class,
                id,
                detector.name()
            ),
            None => log::warn!(
                "target class '{}' is not known to the {} backend; no frame will be positive",
                config.target_class,
                detector.name()
            ),
        }
        Self {
            annotator: Annotator::new(target_id, config.target_class.clone()),
            source,
            detector,
            frames,
            store,
            camera,
            config,
            sequence: 0,
        }
    }

    /// Open the capture source. Failure here is fatal and is not retried.
    pub fn open(&mut self) -> Result<()> {
        let describe = self.source.describe();
        if let Err(err) = self.source.open() {
            self.camera.set(CameraState::Stopped);
            return Err(err).with_context(|| format!("open capture source {}", describe));
        }
        self.camera.set(CameraState::Running);
        log::info!("capture source {} opened", describe);
        Ok(())
    }

    /// Open the source and run the loop on a background thread.
    pub fn start(mut self) -> Result<LoopHandle> {
        self.open()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let join = std::thread::Builder::new()
            .name("detection-loop".to_string())
            .spawn(move || self.run(&stop_flag))
            .context("spawn detection loop thread")?;
        Ok(LoopHandle {
            stop,
            join: Some(join),
        })
    }

    /// Iterate until `stop` is set or the camera halts. Releases the source on exit.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            if self.step() == IterationOutcome::Halted {
                break;
            }
            if !self.config.idle.is_zero() {
                std::thread::sleep(self.config.idle);
            }
        }
        self.source.release();
        self.camera.set(CameraState::Stopped);
        log::info!(
            "detection loop stopped after {} frame(s)",
            self.camera.frames_processed()
        );
    }

    /// Run exactly one iteration.
    pub fn step(&mut self) -> IterationOutcome {
        match self.source.read_frame() {
            Ok(raw) => IterationOutcome::Processed {
                positive: self.process(raw),
            },
            Err(err) => self.reconnect(err),
        }
    }

    fn reconnect(&mut self, err: anyhow::Error) -> IterationOutcome {
        let describe = self.source.describe();
        log::warn!("frame read from {} failed: {:#}; reopening", describe, err);
        self.source.release();
        if !self.config.reconnect_delay.is_zero() {
            std::thread::sleep(self.config.reconnect_delay);
        }
        match self.source.open() {
            Ok(()) => {
                log::info!("capture source {} reopened", describe);
                IterationOutcome::Reconnected
            }
            Err(err) => {
                log::error!("reopening {} failed: {:#}; camera stopped", describe, err);
                self.camera.set(CameraState::Stopped);
                IterationOutcome::Halted
            }
        }
    }

    fn process(&mut self, raw: Frame) -> bool {
        self.sequence += 1;
        let raw = raw.with_sequence(self.sequence);

        let detections = match self
            .detector
            .detect(&raw, self.config.confidence_threshold)
        {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("detection failed on frame {}: {:#}", raw.sequence, err);
                Vec::new()
            }
        };

        let annotated = match self.annotator.annotate(raw, &detections) {
            Ok(annotated) => annotated,
            Err(err) => {
                log::error!("annotation failed on frame {}: {:#}", self.sequence, err);
                return false;
            }
        };
        let positive = annotated.positive;
        self.camera.record_frame();

        if let Some(frame) = self.frames.publish(annotated.frame, positive) {
            self.persist(&frame);
        }
        positive
    }

    fn persist(&self, frame: &Frame) {
        // Encoding once here also fills the cache the snapshot API reads.
        if let Err(err) = frame.jpeg(self.config.jpeg_quality) {
            log::error!("encoding positive frame {} failed: {:#}", frame.sequence, err);
            return;
        }
        if let Err(err) = self.store.insert(frame, &self.config.target_class) {
            log::error!("saving positive frame {} failed: {:#}", frame.sequence, err);
        }
    }
}

/// Handle to a running detection loop.
pub struct LoopHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// True once the loop thread has exited (stopped or halted).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request a stop and wait for the loop thread to exit.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("detection loop thread panicked"))?;
        }
        Ok(())
    }
}
