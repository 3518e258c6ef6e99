pub mod frame;
pub mod pattern;
pub mod roi;
pub mod source;
pub mod v4l2;

pub use frame::{Frame, PixelFormat, SensorReadings};
pub use pattern::PatternSource;
pub use roi::Roi;
pub use source::FrameSource;
pub use v4l2::V4l2Source;
