use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One raw acquisition, owned by the pipeline until the next grab
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,

    /// Raw sensor bytes, tightly packed (no row padding)
    pub data: Bytes,

    /// Sensor capture time translated into the host's wall clock
    pub timestamp: SystemTime,

    /// Driver-reported scalars, when the source exposes them
    pub readings: Option<SensorReadings>,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            width,
            height,
            format,
            data: data.into(),
            timestamp,
            readings: None,
        }
    }

    pub fn with_readings(mut self, readings: SensorReadings) -> Self {
        self.readings = Some(readings);
        self
    }
}

/// Raw pixel formats the conversion engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, byte order Y0 U Y1 V
    Yuyv422,
    /// Single-plane 8-bit greyscale
    Mono8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Yuyv422 => 2,
            PixelFormat::Mono8 => 1,
        }
    }

    /// Exact raw payload size for a tightly packed frame
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv422 => *b"YUYV",
            PixelFormat::Mono8 => *b"GREY",
        }
    }
}

/// Per-frame scalars reported by the driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReadings {
    pub exposure_time_us: f32,
    pub gain: f32,
    pub temperature_c: f32,
}
