//! V4L2 frame source with memory-mapped driver buffers

use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use nix::time::{clock_gettime, ClockId};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::Value;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::roi::Roi;
use super::source::FrameSource;
use super::{Frame, SensorReadings};
use crate::error::GrabError;
use crate::{CaptureConfig, TelemetryConfig};

const V4L2_CID_GAIN: u32 = 0x0098_0913;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

/// V4L2 capture adapter satisfying `FrameSource`
pub struct V4l2Source {
    device: Device,
    stream: MmapStream<'static>,
    config: CaptureConfig,
    /// Window negotiated with the driver, ROI included
    device_width: u32,
    device_height: u32,
    roi: Roi,
    temperature_path: Option<PathBuf>,
    read_controls: bool,
    timeout: Option<Duration>,
    sequence: u64,
}

impl V4l2Source {
    /// Open the device, negotiate format and rate, and start streaming.
    #[instrument(skip_all, fields(device = %config.device))]
    pub fn new(config: CaptureConfig, telemetry: &TelemetryConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {}", config.device);

        let device = Device::with_path(&config.device)?;

        let caps = device.query_caps()?;
        info!("Found camera '{}' ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("Device doesn't support video capture"));
        }

        // The driver delivers the ROI plus its offsets; cropping happens per frame
        let roi = config.roi();
        let (Some(device_width), Some(device_height)) = (
            config.width.checked_add(config.offset_x),
            config.height.checked_add(config.offset_y),
        ) else {
            return Err(eyre!("Region of interest lies outside the sensor range"));
        };

        let mut fmt = device.format()?;
        fmt.width = device_width;
        fmt.height = device_height;
        fmt.fourcc = FourCC::new(&config.format.fourcc());
        let fmt = device.set_format(&fmt)?;

        if fmt.width != device_width || fmt.height != device_height {
            return Err(eyre!(
                "Driver offered {}x{}, need {}x{}",
                fmt.width,
                fmt.height,
                device_width,
                device_height
            ));
        }
        if fmt.fourcc != FourCC::new(&config.format.fourcc()) {
            return Err(eyre!("Driver does not support {:?}", config.format));
        }
        let packed_stride = device_width * config.format.bytes_per_pixel() as u32;
        if fmt.stride != packed_stride {
            return Err(eyre!(
                "Driver pads rows to {} bytes, expected {}",
                fmt.stride,
                packed_stride
            ));
        }

        match device.set_params(&Parameters::with_fps(config.fps)) {
            Ok(params) => info!("Frame interval: {:?}", params.interval),
            Err(e) => warn!("Could not request {} fps: {}", config.fps, e),
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)?;
        info!(
            "Capture stream started with {} buffers",
            config.buffer_count
        );

        Ok(Self {
            device,
            stream,
            device_width,
            device_height,
            roi,
            temperature_path: telemetry
                .enabled
                .then(|| telemetry.temperature_path.clone().map(PathBuf::from))
                .flatten(),
            read_controls: telemetry.enabled,
            timeout: None,
            sequence: 0,
            config,
        })
    }

    fn integer_control(&self, id: u32) -> Option<f32> {
        match self.device.control(id) {
            Ok(control) => match control.value {
                Value::Integer(v) => Some(v as f32),
                _ => None,
            },
            Err(e) => {
                debug!("Control 0x{:08x} unreadable: {}", id, e);
                None
            }
        }
    }

    fn readings(&self) -> Option<SensorReadings> {
        if !self.read_controls {
            return None;
        }

        // V4L2 reports absolute exposure in units of 100 µs
        let exposure_time_us = self.integer_control(V4L2_CID_EXPOSURE_ABSOLUTE)? * 100.0;
        let gain = self.integer_control(V4L2_CID_GAIN).unwrap_or(0.0);
        let temperature_c = self
            .temperature_path
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|raw| raw.trim().parse::<f32>().ok())
            .map(|milli| milli / 1000.0)
            .unwrap_or(f32::NAN);

        Some(SensorReadings {
            exposure_time_us,
            gain,
            temperature_c,
        })
    }
}

impl FrameSource for V4l2Source {
    fn grab(&mut self, timeout: Duration) -> std::result::Result<Frame, GrabError> {
        if self.timeout != Some(timeout) {
            self.stream.set_timeout(timeout);
            self.timeout = Some(timeout);
        }

        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(GrabError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(e) => return Err(GrabError::fatal(format!("VIDIOC_DQBUF: {e}"))),
        };

        let timestamp = host_time(Duration::new(
            meta.timestamp.sec.max(0) as u64,
            (meta.timestamp.usec.max(0) as u32).saturating_mul(1_000),
        ));

        let used = (meta.bytesused as usize).min(buf.len());
        let data = if self.roi.is_origin() {
            Bytes::copy_from_slice(&buf[..used])
        } else {
            let mut cropped = Vec::new();
            self.roi
                .crop(
                    &buf[..used],
                    self.config.format,
                    self.device_width,
                    self.device_height,
                    &mut cropped,
                )
                .map_err(|e| GrabError::fatal(e.to_string()))?;
            Bytes::from(cropped)
        };

        self.sequence += 1;
        debug!(sequence = self.sequence, driver_sequence = meta.sequence, "grabbed");

        let frame = Frame::new(
            self.config.width,
            self.config.height,
            self.config.format,
            data,
            timestamp,
        );
        Ok(match self.readings() {
            Some(readings) => frame.with_readings(readings),
            None => frame,
        })
    }

    fn describe(&self) -> String {
        format!("V4L2 {} ({:?})", self.config.device, self.config.format)
    }
}

/// Translate a CLOCK_MONOTONIC driver timestamp into wall-clock time at pickup.
fn host_time(captured: Duration) -> SystemTime {
    let now_wall = SystemTime::now();
    let Ok(now) = clock_gettime(ClockId::CLOCK_MONOTONIC) else {
        return now_wall;
    };
    let now_mono = Duration::new(now.tv_sec().max(0) as u64, now.tv_nsec().max(0) as u32);
    let age = now_mono.saturating_sub(captured);
    now_wall.checked_sub(age).unwrap_or(now_wall)
}
