pub mod capture;
pub mod convert;
pub mod error;
pub mod pipeline;
pub mod shm;
pub mod telemetry;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::source::{DEFAULT_GRAB_TIMEOUT, MAX_GRAB_TIMEOUT};
use capture::{PixelFormat, Roi};
use error::ConfigError;
use serde::{Deserialize, Serialize};

/// Environment prefix for overrides, e.g. `SHMCAM__CAPTURE__WIDTH=1280`
pub const ENV_PREFIX: &str = "SHMCAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub shared_memory: SharedMemoryConfig,
    pub pipeline: PipelineConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node; empty to auto-detect, `pattern://` for a synthetic source
    pub device: String,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Region-of-interest offsets into the sensor image
    pub offset_x: u32,
    pub offset_y: u32,
    pub fps: u32,
    pub buffer_count: u32,
    /// Upper bound for a single grab
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    pub base_name: String,
    pub i420_name: Option<String>,
    pub argb_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub skip_argb: bool,
    /// Pin the capture thread to this core
    pub cpu_affinity: Option<usize>,
    /// Throughput log interval, 0 disables it
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Numeric sender identifier stamped on every message
    pub sender_id: u32,
    /// Sysfs file reporting millidegrees Celsius
    pub temperature_path: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            format: PixelFormat::Yuyv422,
            width: 640,
            height: 480,
            offset_x: 0,
            offset_y: 0,
            fps: 30,
            buffer_count: 4,
            timeout_ms: DEFAULT_GRAB_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            base_name: "cam0".into(),
            i420_name: None,
            argb_name: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip_argb: false,
            cpu_affinity: None,
            stats_interval_secs: 10,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sender_id: 0,
            temperature_path: Some("/sys/class/thermal/thermal_zone0/temp".into()),
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn roi(&self) -> Roi {
        Roi {
            x: self.offset_x,
            y: self.offset_y,
            width: self.width,
            height: self.height,
        }
    }
}

impl SharedMemoryConfig {
    /// Resolved `(i420, argb)` segment names
    pub fn names(&self) -> (String, String) {
        let (i420, argb) = shm::default_names(&self.base_name);
        (
            self.i420_name.clone().unwrap_or(i420),
            self.argb_name.clone().unwrap_or(argb),
        )
    }
}

impl Config {
    /// Defaults, then an optional TOML file, then `SHMCAM__*` environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.capture;
        if c.width == 0 || c.height == 0 || c.width % 2 != 0 || c.height % 2 != 0 {
            return Err(ConfigError::Dimensions {
                width: c.width,
                height: c.height,
            });
        }
        if c.format == PixelFormat::Yuyv422 && c.offset_x % 2 != 0 {
            return Err(ConfigError::UnalignedOffset(c.format));
        }
        if c.width.checked_add(c.offset_x).is_none() {
            return Err(ConfigError::OffsetOutOfRange {
                axis: "x",
                offset: c.offset_x,
            });
        }
        if c.height.checked_add(c.offset_y).is_none() {
            return Err(ConfigError::OffsetOutOfRange {
                axis: "y",
                offset: c.offset_y,
            });
        }
        if c.fps == 0 {
            return Err(ConfigError::Zero("fps"));
        }
        if c.timeout_ms == 0 {
            return Err(ConfigError::Zero("timeout_ms"));
        }
        if c.timeout() > MAX_GRAB_TIMEOUT {
            return Err(ConfigError::TimeoutTooLong {
                timeout_ms: c.timeout_ms,
                max_ms: MAX_GRAB_TIMEOUT.as_millis() as u64,
            });
        }
        if c.buffer_count == 0 {
            return Err(ConfigError::Zero("buffer_count"));
        }

        let (i420, argb) = self.shared_memory.names();
        if i420 == argb {
            return Err(ConfigError::DuplicateSegmentName(i420));
        }
        Ok(())
    }
}
