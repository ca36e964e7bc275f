use crate::base_types::SegmentId;
use more_asserts::*;
use roaring::RoaringBitmap;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use util::From64;

/// Free-segment bitmap with a rotating allocation cursor.
///
/// In memory the *free* ids are kept in a RoaringBitmap; the durable form is
/// the inverted sense (bit set == allocated), packed into little-endian u64
/// words.  The internal mutex is below every other lock in the system, so it
/// may be taken while a per-segment state lock is held.
pub struct FreeSegmentBitmap {
    inner: Mutex<Inner>,
    // Relaxed mirror of the free count, for telemetry and GC-threshold
    // polling that must not contend on the mutex.
    free_count_weak: AtomicU64,
}

struct Inner {
    free: RoaringBitmap,
    cursor: u32,
    num_segments: u32,
}

impl FreeSegmentBitmap {
    pub fn new(num_segments: u32) -> FreeSegmentBitmap {
        let mut free = RoaringBitmap::new();
        free.insert_range(0..num_segments);
        FreeSegmentBitmap {
            inner: Mutex::new(Inner {
                free,
                cursor: 0,
                num_segments,
            }),
            free_count_weak: AtomicU64::new(u64::from(num_segments)),
        }
    }

    /// Find-and-set of the first clear (free) bit at or after the cursor,
    /// wrapping around once.  Advances the cursor past the returned id so
    /// consecutive allocations rotate through the array.
    pub fn allocate_first_clear(&self) -> Option<SegmentId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free.is_empty() {
            return None;
        }
        let cursor = inner.cursor;
        let picked = Inner::first_free_at_or_after(&inner.free, cursor)
            .or_else(|| inner.free.min())
            .unwrap();
        let removed = inner.free.remove(picked);
        assert!(removed);
        inner.cursor = if picked + 1 >= inner.num_segments {
            0
        } else {
            picked + 1
        };
        self.free_count_weak
            .store(inner.free.len(), Ordering::Relaxed);
        Some(SegmentId(picked))
    }

    /// Release; must be called exactly once per allocation.
    pub fn clear(&self, segment: SegmentId) {
        let mut inner = self.inner.lock().unwrap();
        assert_lt!(segment.0, inner.num_segments);
        let inserted = inner.free.insert(segment.0);
        assert!(inserted, "double release of segment {}", segment);
        self.free_count_weak
            .store(inner.free.len(), Ordering::Relaxed);
    }

    /// Claim a specific segment, used when reconstructing in-memory state
    /// (context load, journal replay).
    pub fn mark_allocated(&self, segment: SegmentId) {
        let mut inner = self.inner.lock().unwrap();
        assert_lt!(segment.0, inner.num_segments);
        let removed = inner.free.remove(segment.0);
        assert!(removed, "double alloc of segment {} during import", segment);
        self.free_count_weak
            .store(inner.free.len(), Ordering::Relaxed);
    }

    pub fn is_allocated(&self, segment: SegmentId) -> bool {
        !self.inner.lock().unwrap().free.contains(segment.0)
    }

    pub fn num_clear(&self) -> u64 {
        self.inner.lock().unwrap().free.len()
    }

    /// Relaxed read; may lag concurrent allocations and releases.
    pub fn num_clear_weak(&self) -> u64 {
        self.free_count_weak.load(Ordering::Relaxed)
    }

    /// The durable form: bit i set == segment i allocated.  Unused tail bits
    /// of the last word are zero.
    pub fn to_allocated_words(&self) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        let num_words = usize::from64(u64::from(inner.num_segments).div_ceil(64));
        let mut words = vec![u64::MAX; num_words];
        for id in &inner.free {
            words[(id / 64) as usize] &= !(1u64 << (id % 64));
        }
        let tail_bits = inner.num_segments % 64;
        if tail_bits != 0 {
            *words.last_mut().unwrap() &= (1u64 << tail_bits) - 1;
        }
        words
    }

    /// Rebuild from the durable form, replacing the current contents.  The
    /// cursor restarts at zero; it is a performance hint, not state.
    pub fn load_allocated_words(&self, words: &[u64]) {
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(
            words.len(),
            usize::from64(u64::from(inner.num_segments).div_ceil(64))
        );
        inner.free.clear();
        for id in 0..inner.num_segments {
            if words[(id / 64) as usize] & (1u64 << (id % 64)) == 0 {
                inner.free.insert(id);
            }
        }
        inner.cursor = 0;
        self.free_count_weak
            .store(inner.free.len(), Ordering::Relaxed);
    }
}

impl Inner {
    fn first_free_at_or_after(free: &RoaringBitmap, cursor: u32) -> Option<u32> {
        // rank() counts members <= cursor-1, i.e. the free ids the cursor
        // has already rotated past; select() skips them.
        let skipped = if cursor == 0 {
            0
        } else {
            u32::try_from(free.rank(cursor - 1)).unwrap()
        };
        free.select(skipped)
    }
}
