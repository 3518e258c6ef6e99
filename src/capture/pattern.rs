//! Synthetic frame source for running the pipeline without a camera.
//!
//! Selected with a `pattern://` device path. Produces a diagonal gradient
//! that shifts by one step per frame, paced at the configured frame rate.

use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::info;

use super::source::FrameSource;
use super::{Frame, PixelFormat, SensorReadings};
use crate::error::GrabError;
use crate::CaptureConfig;

pub const PATTERN_SCHEME: &str = "pattern://";

pub struct PatternSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    interval: Duration,
    next_due: Instant,
    sequence: u64,
    readings: bool,
}

impl PatternSource {
    pub fn new(config: &CaptureConfig, readings: bool) -> Self {
        info!(
            "Synthetic {}x{} {:?} source at {} fps",
            config.width, config.height, config.format, config.fps
        );
        Self {
            width: config.width,
            height: config.height,
            format: config.format,
            interval: Duration::from_secs(1) / config.fps.max(1),
            next_due: Instant::now(),
            sequence: 0,
            readings,
        }
    }

    fn render(&self) -> Vec<u8> {
        let shift = self.sequence as usize;
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = Vec::with_capacity(self.format.frame_size(self.width, self.height));

        for y in 0..h {
            for x in 0..w {
                let luma = ((x + y + shift) & 0xff) as u8;
                match self.format {
                    PixelFormat::Mono8 => data.push(luma),
                    PixelFormat::Yuyv422 => {
                        // Even pixels carry U, odd pixels carry V
                        let chroma = if x % 2 == 0 {
                            ((x * 255) / w.max(1)) as u8
                        } else {
                            ((y * 255) / h.max(1)) as u8
                        };
                        data.push(luma);
                        data.push(chroma);
                    }
                }
            }
        }
        data
    }
}

impl FrameSource for PatternSource {
    fn grab(&mut self, timeout: Duration) -> Result<Frame, GrabError> {
        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Err(GrabError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(wait);
        }
        self.next_due = Instant::now() + self.interval;

        let frame = Frame::new(
            self.width,
            self.height,
            self.format,
            self.render(),
            SystemTime::now(),
        );
        self.sequence += 1;

        Ok(if self.readings {
            frame.with_readings(SensorReadings {
                exposure_time_us: 10_000.0,
                gain: 1.0,
                temperature_c: 35.0 + (self.sequence % 10) as f32 * 0.1,
            })
        } else {
            frame
        })
    }

    fn describe(&self) -> String {
        format!("{PATTERN_SCHEME}{}x{}", self.width, self.height)
    }
}
