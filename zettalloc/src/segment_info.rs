use std::convert::TryFrom;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Lifecycle state of one segment.
///
/// Allocation moves FREE->NVRAM (write-buffer resident), the flusher moves
/// NVRAM->SSD, GC promotes SSD->VICTIM, and reclaim returns any in-use state
/// to FREE.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    Free = 0,
    Nvram = 1,
    Ssd = 2,
    Victim = 3,
}

impl SegmentState {
    pub fn can_transition_to(self, next: SegmentState) -> bool {
        matches!(
            (self, next),
            (SegmentState::Free, SegmentState::Nvram)
                | (SegmentState::Nvram, SegmentState::Ssd)
                | (SegmentState::Ssd, SegmentState::Victim)
                | (SegmentState::Nvram, SegmentState::Free)
                | (SegmentState::Ssd, SegmentState::Free)
                | (SegmentState::Victim, SegmentState::Free)
        )
    }
}

impl TryFrom<u8> for SegmentState {
    type Error = u8;

    fn try_from(value: u8) -> Result<SegmentState, u8> {
        match value {
            0 => Ok(SegmentState::Free),
            1 => Ok(SegmentState::Nvram),
            2 => Ok(SegmentState::Ssd),
            3 => Ok(SegmentState::Victim),
            other => Err(other),
        }
    }
}

/// Per-segment bookkeeping.  The counters are bare atomics so that the write
/// path never takes a lock for a counter update; the state mutex is the
/// per-segment serialization point for lifecycle transitions (and doubles as
/// the per-segment lock of the free decision).
pub struct SegmentInfo {
    valid_blocks: AtomicU32,
    occupied_stripes: AtomicU32,
    state: Mutex<SegmentState>,
}

impl Default for SegmentInfo {
    fn default() -> SegmentInfo {
        SegmentInfo {
            valid_blocks: AtomicU32::new(0),
            occupied_stripes: AtomicU32::new(0),
            state: Mutex::new(SegmentState::Free),
        }
    }
}

impl SegmentInfo {
    pub fn valid_blocks(&self) -> u32 {
        self.valid_blocks.load(Ordering::SeqCst)
    }

    pub fn occupied_stripes(&self) -> u32 {
        self.occupied_stripes.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SegmentState {
        *self.state.lock().unwrap()
    }

    pub fn increase_valid_blocks(&self, count: u32) -> u32 {
        self.valid_blocks.fetch_add(count, Ordering::SeqCst) + count
    }

    /// Returns the post-decrement count.  Underflow means the mapper and the
    /// allocator disagree about liveness; there is no way to continue.
    pub fn decrease_valid_blocks(&self, count: u32) -> u32 {
        let old = self
            .valid_blocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                v.checked_sub(count)
            })
            .unwrap_or_else(|old| {
                panic!(
                    "valid block count underflow: {} valid, decrementing by {}",
                    old, count
                )
            });
        old - count
    }

    pub fn increase_occupied_stripes(&self) -> u32 {
        self.occupied_stripes.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_counters(&self, valid_blocks: u32, occupied_stripes: u32) {
        self.valid_blocks.store(valid_blocks, Ordering::SeqCst);
        self.occupied_stripes.store(occupied_stripes, Ordering::SeqCst);
    }

    pub fn lock_state(&self) -> MutexGuard<'_, SegmentState> {
        self.state.lock().unwrap()
    }

    /// Transition under the per-segment lock, panicking on anything the
    /// lifecycle does not allow.
    pub fn set_state(&self, next: SegmentState) {
        let mut state = self.lock_state();
        assert!(
            state.can_transition_to(next),
            "illegal segment state transition {:?} -> {:?}",
            *state,
            next
        );
        *state = next;
    }

    /// Used only when reconstructing state from a loaded context file, where
    /// the segment may land in any state directly.
    pub fn force_state(&self, state: SegmentState) {
        *self.lock_state() = state;
    }
}
