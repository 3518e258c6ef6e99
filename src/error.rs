//! Error taxonomy for the capture → convert → publish pipeline

use thiserror::Error;

use crate::capture::PixelFormat;

/// Outcome of a failed `FrameSource::grab`
#[derive(Debug, Error)]
pub enum GrabError {
    /// No frame arrived within the grab timeout. Recoverable.
    #[error("timed out after {timeout_ms} ms waiting for a frame")]
    Timeout { timeout_ms: u64 },

    /// Driver or hardware failure. Terminates the capture loop.
    #[error("frame source failed: {0}")]
    Fatal(String),
}

impl GrabError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("{what} buffer holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("frame is {actual_width}x{actual_height}, pipeline is configured for {width}x{height}")]
    GeometryMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("{width}x{height} cannot be subsampled to 4:2:0; both dimensions must be even and non-zero")]
    OddDimensions { width: u32, height: u32 },
}

/// Failures of a shared frame segment
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("invalid segment name {0:?}")]
    InvalidName(String),

    #[error("segment '{name}' cannot have a capacity of {capacity} bytes")]
    InvalidSize { name: String, capacity: usize },

    #[error("{op} failed for segment '{name}': {source}")]
    Os {
        name: String,
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("failed to map segment '{name}': {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("segment '{0}' exists but has not been initialized by its producer")]
    NotReady(String),

    #[error("lock of segment '{0}' was abandoned by a dead process")]
    Abandoned(String),

    #[error("locking segment '{name}' failed: {source}")]
    Lock {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("segment '{name}' holds {capacity} bytes, image has {actual}")]
    SizeMismatch {
        name: String,
        capacity: usize,
        actual: usize,
    },
}

/// Invalid startup configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("width and height must be even and non-zero, got {width}x{height}")]
    Dimensions { width: u32, height: u32 },

    #[error("offset_x must be even for {0:?} frames")]
    UnalignedOffset(PixelFormat),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{axis} offset {offset} pushes the capture window past the sensor range")]
    OffsetOutOfRange { axis: &'static str, offset: u32 },

    #[error("timeout_ms {timeout_ms} exceeds the {max_ms} ms limit")]
    TimeoutTooLong { timeout_ms: u64, max_ms: u64 },

    #[error("I420 and ARGB segments cannot share the name '{0}'")]
    DuplicateSegmentName(String),

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry receiver has disconnected")]
    Disconnected,
}

/// Everything that can unwind the capture loop
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("segment setup failed: {0}")]
    Setup(#[from] ShmError),

    #[error(transparent)]
    Grab(#[from] GrabError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("publishing to segment failed: {0}")]
    Publish(#[source] ShmError),
}
