use lazy_static::lazy_static;
use more_asserts::*;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU32, Ordering};
use util::get_tunable;

lazy_static! {
    static ref DEFAULT_NORMAL_GC_THRESHOLD: u32 = get_tunable("gc_normal_threshold", 20);
    static ref DEFAULT_URGENT_GC_THRESHOLD: u32 = get_tunable("gc_urgent_threshold", 5);
}

/// GC urgency, a non-increasing step function of the free-segment count.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum GcMode {
    NoGc = 0,
    Normal = 1,
    Urgent = 2,
}

impl TryFrom<u8> for GcMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<GcMode, u8> {
        match value {
            0 => Ok(GcMode::NoGc),
            1 => Ok(GcMode::Normal),
            2 => Ok(GcMode::Urgent),
            other => Err(other),
        }
    }
}

/// Maps the free-segment count to a GC mode.  Pure; holds no reference to
/// the segment context.
pub struct GcCtx {
    normal_threshold: AtomicU32,
    urgent_threshold: AtomicU32,
}

impl Default for GcCtx {
    fn default() -> GcCtx {
        GcCtx::new(*DEFAULT_NORMAL_GC_THRESHOLD, *DEFAULT_URGENT_GC_THRESHOLD)
    }
}

impl GcCtx {
    pub fn new(normal_threshold: u32, urgent_threshold: u32) -> GcCtx {
        assert_le!(urgent_threshold, normal_threshold);
        GcCtx {
            normal_threshold: AtomicU32::new(normal_threshold),
            urgent_threshold: AtomicU32::new(urgent_threshold),
        }
    }

    pub fn current_gc_mode(&self, num_free_segments: u64) -> GcMode {
        if num_free_segments <= u64::from(self.urgent_threshold()) {
            GcMode::Urgent
        } else if num_free_segments <= u64::from(self.normal_threshold()) {
            GcMode::Normal
        } else {
            GcMode::NoGc
        }
    }

    pub fn normal_threshold(&self) -> u32 {
        self.normal_threshold.load(Ordering::SeqCst)
    }

    pub fn urgent_threshold(&self) -> u32 {
        self.urgent_threshold.load(Ordering::SeqCst)
    }

    pub fn set_normal_threshold(&self, threshold: u32) {
        assert_le!(self.urgent_threshold(), threshold);
        self.normal_threshold.store(threshold, Ordering::SeqCst);
    }

    pub fn set_urgent_threshold(&self, threshold: u32) {
        assert_le!(threshold, self.normal_threshold());
        self.urgent_threshold.store(threshold, Ordering::SeqCst);
    }

    /// Returns the normal threshold for NORMAL mode and the urgent threshold
    /// for every other mode, including NO_GC.  Historical surface; callers
    /// should only consult it while GC is active.
    pub fn gc_threshold(&self, mode: GcMode) -> u32 {
        if mode == GcMode::Normal {
            self.normal_threshold()
        } else {
            self.urgent_threshold()
        }
    }
}
