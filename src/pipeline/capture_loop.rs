//! The single producer: grab → convert → publish, until cancelled

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::cancel::CancellationToken;
use super::stats::{LoopCounters, LoopStats};
use crate::capture::{Frame, FrameSource};
use crate::convert::{self, argb_size, i420_size, I420Layout};
use crate::error::{ConversionError, GrabError, PipelineError, ShmError, TelemetryError};
use crate::shm::SharedSegment;
use crate::telemetry::{TelemetrySample, TelemetrySink};

/// The two published images of one camera
#[derive(Debug)]
pub struct Segments {
    pub i420: SharedSegment,
    pub argb: SharedSegment,
}

impl Segments {
    /// Create both segments sized exactly for `width x height`.
    #[instrument]
    pub fn create(
        i420_name: &str,
        argb_name: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, ShmError> {
        let i420 = SharedSegment::create(i420_name, i420_size(width, height))?;
        let argb = SharedSegment::create(argb_name, argb_size(width, height))?;
        info!(
            "Frames available in I420 format in shared memory '{}' ({}) and in ARGB format in shared memory '{}' ({})",
            i420.name(),
            i420.capacity(),
            argb.name(),
            argb.capacity()
        );
        Ok(Self { i420, argb })
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub width: u32,
    pub height: u32,
    pub grab_timeout: Duration,
    /// Publish only I420
    pub skip_argb: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    ShuttingDown,
    Terminated,
}

pub struct CaptureLoop<S: FrameSource> {
    state: LoopState,
    source: Option<S>,
    segments: Option<Segments>,
    telemetry: Option<Box<dyn TelemetrySink>>,
    options: LoopOptions,
    i420: Vec<u8>,
    argb: Vec<u8>,
    counters: Arc<LoopCounters>,
}

impl<S: FrameSource> CaptureLoop<S> {
    /// Check that the segments match the frame geometry exactly.
    pub fn new(source: S, segments: Segments, options: LoopOptions) -> Result<Self, PipelineError> {
        let layout = I420Layout::new(options.width, options.height)?;
        let argb_len = argb_size(options.width, options.height);

        if segments.i420.capacity() != layout.total() {
            return Err(PipelineError::Configuration(format!(
                "segment '{}' holds {} bytes, {}x{} I420 needs {}",
                segments.i420.name(),
                segments.i420.capacity(),
                options.width,
                options.height,
                layout.total()
            )));
        }
        if segments.argb.capacity() != argb_len {
            return Err(PipelineError::Configuration(format!(
                "segment '{}' holds {} bytes, {}x{} ARGB needs {}",
                segments.argb.name(),
                segments.argb.capacity(),
                options.width,
                options.height,
                argb_len
            )));
        }

        Ok(Self {
            state: LoopState::Idle,
            source: Some(source),
            segments: Some(segments),
            telemetry: None,
            i420: vec![0; layout.total()],
            argb: if options.skip_argb {
                Vec::new()
            } else {
                vec![0; argb_len]
            },
            options,
            counters: Arc::default(),
        })
    }

    pub fn with_telemetry(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Live counters, shareable with a monitoring thread
    pub fn counters(&self) -> Arc<LoopCounters> {
        Arc::clone(&self.counters)
    }

    /// Run until `cancel` fires or a fatal error occurs. The frame source and
    /// both segments are released before returning, either way.
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<LoopStats, PipelineError> {
        if self.state != LoopState::Idle {
            return Err(PipelineError::Configuration(format!(
                "capture loop cannot start from {:?}",
                self.state
            )));
        }

        if let Some(source) = &self.source {
            info!("Capturing from {}", source.describe());
        }
        self.state = LoopState::Running;

        let result = self.run_frames(cancel);

        self.state = LoopState::ShuttingDown;
        if let Err(e) = &result {
            error!("Capture loop stopped: {}", e);
        }
        self.release();

        result.map(|_| self.counters.snapshot())
    }

    fn run_frames(&mut self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let timeout = self.options.grab_timeout;

        while !cancel.is_cancelled() {
            let Some(source) = self.source.as_mut() else {
                break;
            };

            let frame = match source.grab(timeout) {
                Ok(frame) => frame,
                Err(GrabError::Timeout { timeout_ms }) => {
                    // Readers keep the last good frame
                    warn!("Timeout while grabbing frame ({} ms)", timeout_ms);
                    self.counters.grab_timed_out();
                    metrics::counter!("shmcam_grab_timeouts_total").increment(1);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.counters.frame_grabbed();
            metrics::counter!("shmcam_frames_grabbed_total").increment(1);
            self.process(&frame)?;
        }

        info!("Cancellation requested, leaving capture loop");
        Ok(())
    }

    /// Convert one frame and publish it to both segments.
    fn process(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        let LoopOptions {
            width,
            height,
            skip_argb,
            ..
        } = self.options;

        if frame.width != width || frame.height != height {
            return Err(ConversionError::GeometryMismatch {
                width,
                height,
                actual_width: frame.width,
                actual_height: frame.height,
            }
            .into());
        }

        // Both conversions finish before anything is published
        let started = Instant::now();
        convert::to_i420(&frame.data, frame.format, width, height, &mut self.i420)?;
        if !skip_argb {
            convert::i420_to_argb(&self.i420, width, height, &mut self.argb)?;
        }
        metrics::histogram!("shmcam_conversion_seconds").record(started.elapsed().as_secs_f64());

        let Some(segments) = self.segments.as_ref() else {
            return Ok(());
        };

        let sequence = segments
            .i420
            .publish(&self.i420, frame.timestamp)
            .map_err(PipelineError::Publish)?;
        self.counters.i420_published();
        metrics::counter!("shmcam_frames_published_total", "format" => "i420").increment(1);

        if !skip_argb {
            segments
                .argb
                .publish(&self.argb, frame.timestamp)
                .map_err(PipelineError::Publish)?;
            self.counters.argb_published();
            metrics::counter!("shmcam_frames_published_total", "format" => "argb").increment(1);
        }

        debug!(sequence, "published frame");

        self.forward_telemetry(frame);
        Ok(())
    }

    fn forward_telemetry(&mut self, frame: &Frame) {
        let (Some(sink), Some(readings)) = (self.telemetry.as_mut(), frame.readings.as_ref()) else {
            return;
        };

        let sample = TelemetrySample::from_readings(readings, frame.timestamp);
        match sink.publish(&sample) {
            Ok(()) => {
                self.counters.telemetry_sent();
                metrics::counter!("shmcam_telemetry_published_total").increment(1);
            }
            Err(TelemetryError::Disconnected) => {
                warn!("Telemetry receiver went away, no further telemetry will be sent");
                self.telemetry = None;
            }
        }
    }

    /// ShuttingDown → Terminated
    fn release(&mut self) {
        if let Some(source) = self.source.take() {
            debug!("Releasing {}", source.describe());
            drop(source);
        }
        self.segments = None;
        self.telemetry = None;
        self.state = LoopState::Terminated;
        info!("Capture loop terminated");
    }
}
