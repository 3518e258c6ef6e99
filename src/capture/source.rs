//! The boundary between vendor drivers and the publish pipeline

use std::time::Duration;

use super::Frame;
use crate::error::GrabError;

/// Default grab timeout for a free-running sensor
pub const DEFAULT_GRAB_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound for slow or externally triggered sensors
pub const MAX_GRAB_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can hand the capture loop one raw frame at a time.
///
/// Implementations must return within `timeout`, reporting
/// `GrabError::Timeout` when no frame arrived and `GrabError::Fatal` for
/// any fault the driver cannot recover from. The handle is released on drop.
pub trait FrameSource {
    fn grab(&mut self, timeout: Duration) -> Result<Frame, GrabError>;

    /// Human readable identifier for logs
    fn describe(&self) -> String {
        "frame source".to_string()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn grab(&mut self, timeout: Duration) -> Result<Frame, GrabError> {
        (**self).grab(timeout)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
