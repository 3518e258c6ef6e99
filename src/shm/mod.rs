//! Shared frame buffers: the last-write-wins hand-off to co-located readers.
//!
//! Publish protocol per segment and frame: lock, overwrite the whole
//! payload, store the capture timestamp, unlock, broadcast. Readers take the
//! same lock and may wait on the same condition variable. There is no queue;
//! a slow reader simply sees a newer frame.

mod segment;
mod sync;

pub use segment::{SegmentGuard, SharedSegment};

/// Segment name suffix for the planar I420 image
pub const I420_SUFFIX: &str = ".i420";
/// Segment name suffix for the packed ARGB image
pub const ARGB_SUFFIX: &str = ".argb";

/// Default segment names derived from a base name: `<base>.i420`, `<base>.argb`
pub fn default_names(base: &str) -> (String, String) {
    (format!("{base}{I420_SUFFIX}"), format!("{base}{ARGB_SUFFIX}"))
}

#[cfg(test)]
pub(crate) fn unique_test_name(tag: &str) -> String {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!(
        "shmcam-unit-{}-{}-{}",
        std::process::id(),
        tag,
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}
