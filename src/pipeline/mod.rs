pub mod cancel;
pub mod capture_loop;
pub mod stats;

pub use cancel::CancellationToken;
pub use capture_loop::{CaptureLoop, LoopOptions, LoopState, Segments};
pub use stats::{LoopCounters, LoopStats};
