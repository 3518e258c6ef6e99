//! Lock-free per-loop counters, readable from other threads while running

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

#[derive(Default)]
pub struct LoopCounters {
    frames_grabbed: CachePadded<AtomicU64>,
    grab_timeouts: CachePadded<AtomicU64>,
    published_i420: CachePadded<AtomicU64>,
    published_argb: CachePadded<AtomicU64>,
    telemetry_published: CachePadded<AtomicU64>,
}

/// Point-in-time copy of [`LoopCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames_grabbed: u64,
    pub grab_timeouts: u64,
    pub published_i420: u64,
    pub published_argb: u64,
    pub telemetry_published: u64,
}

impl LoopCounters {
    pub(crate) fn frame_grabbed(&self) {
        self.frames_grabbed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn grab_timed_out(&self) {
        self.grab_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn i420_published(&self) {
        self.published_i420.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn argb_published(&self) {
        self.published_argb.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn telemetry_sent(&self) {
        self.telemetry_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoopStats {
        LoopStats {
            frames_grabbed: self.frames_grabbed.load(Ordering::Relaxed),
            grab_timeouts: self.grab_timeouts.load(Ordering::Relaxed),
            published_i420: self.published_i420.load(Ordering::Relaxed),
            published_argb: self.published_argb.load(Ordering::Relaxed),
            telemetry_published: self.telemetry_published.load(Ordering::Relaxed),
        }
    }
}
