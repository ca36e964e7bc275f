use crate::base_types::*;
use crate::context_io::ContextIoClient;
use crate::error::{AllocError, AllocResult};
use crate::free_bitmap::FreeSegmentBitmap;
use crate::segment_info::{SegmentInfo, SegmentState};
use log::*;
use more_asserts::*;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use util::From64;

pub const SIG_SEGMENT_CTX: u32 = 0xAFAF_AFAF;
pub const SEGMENT_CTX_FILENAME: &str = "SegmentContext";

const SECTION_HEADER: usize = 0;
const SECTION_SEGMENT_INFO: usize = 1;
const SECTION_FREE_BITMAP: usize = 2;
const NUM_SECTIONS: usize = 3;

// u32 valid blocks + u32 occupied stripes + u8 state, fixed-int encoded.
const SEGMENT_INFO_PHYS_SIZE: usize = 9;
const BITMAP_WORD_SIZE: usize = 8;

#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
struct SegmentCtxHeaderPhys {
    sig: u32,
    version: u64,
    num_sections: u32,
}
impl OnDisk for SegmentCtxHeaderPhys {}

#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
struct SegmentInfoPhys {
    valid_blocks: u32,
    occupied_stripes: u32,
    state: u8,
}
impl OnDisk for SegmentInfoPhys {}

/// Per-segment counters, lifecycle states, and the free-segment bitmap.
///
/// Counter updates are lock-free; the decision to free a segment is made
/// under that segment's state lock, so the transition to FREE happens
/// exactly once no matter how decrements and stripe completions interleave.
pub struct SegmentCtx {
    segment_infos: Vec<SegmentInfo>,
    free_bitmap: FreeSegmentBitmap,
    dirty_version: AtomicU64,
    stored_version: AtomicU64,
    geometry: Geometry,
    // Context-global lock; only the locked free-count read takes it.
    ctx_lock: Mutex<()>,
}

impl SegmentCtx {
    pub fn new(geometry: Geometry) -> SegmentCtx {
        let num_segments = geometry.num_user_segments as usize;
        let mut segment_infos = Vec::with_capacity(num_segments);
        segment_infos.resize_with(num_segments, SegmentInfo::default);
        SegmentCtx {
            segment_infos,
            free_bitmap: FreeSegmentBitmap::new(geometry.num_user_segments),
            dirty_version: AtomicU64::new(0),
            stored_version: AtomicU64::new(0),
            geometry,
            ctx_lock: Mutex::new(()),
        }
    }

    fn info(&self, segment: SegmentId) -> &SegmentInfo {
        &self.segment_infos[segment.as_index()]
    }

    pub fn total_segment_count(&self) -> u32 {
        self.geometry.num_user_segments
    }

    /// Atomic add; never fails.
    pub fn increase_valid_block_count(&self, segment: SegmentId, count: u32) -> u32 {
        self.info(segment).increase_valid_blocks(count)
    }

    /// Returns true iff this call freed the segment.
    pub fn decrease_valid_block_count(&self, segment: SegmentId, count: u32) -> bool {
        let info = self.info(segment);
        if info.decrease_valid_blocks(count) > 0 {
            return false;
        }
        // Exactly one decrement observes zero, but the segment is only
        // reclaimable once every stripe has been written; re-verify the full
        // condition under the per-segment lock.
        let mut state = info.lock_state();
        if info.valid_blocks() == 0
            && info.occupied_stripes() == self.geometry.stripes_per_segment
            && matches!(*state, SegmentState::Ssd | SegmentState::Victim)
        {
            self.free_segment_locked(segment, &mut state);
            true
        } else {
            false
        }
    }

    /// Returns true iff this call freed the segment (the last stripe of a
    /// segment whose blocks were already all invalidated).
    pub fn increase_occupied_stripe_count(&self, segment: SegmentId) -> bool {
        let info = self.info(segment);
        let occupied = info.increase_occupied_stripes();
        assert_le!(
            occupied,
            self.geometry.stripes_per_segment,
            "occupied stripe count overflow on segment {}",
            segment
        );
        if occupied < self.geometry.stripes_per_segment {
            return false;
        }
        let mut state = info.lock_state();
        if info.occupied_stripes() == self.geometry.stripes_per_segment
            && info.valid_blocks() == 0
            && *state != SegmentState::Free
        {
            self.free_segment_locked(segment, &mut state);
            true
        } else {
            false
        }
    }

    fn free_segment_locked(&self, segment: SegmentId, state: &mut SegmentState) {
        assert_eq!(self.info(segment).valid_blocks(), 0);
        assert_ne!(*state, SegmentState::Free);
        *state = SegmentState::Free;
        self.info(segment).reset_counters(0, 0);
        // The bitmap lock nests below the per-segment lock.
        self.free_bitmap.clear(segment);
        debug!("segment {} freed", segment);
    }

    pub fn get_valid_block_count(&self, segment: SegmentId) -> u32 {
        self.info(segment).valid_blocks()
    }

    pub fn get_occupied_stripe_count(&self, segment: SegmentId) -> u32 {
        self.info(segment).occupied_stripes()
    }

    pub fn set_segment_state(&self, segment: SegmentId, state: SegmentState) {
        self.info(segment).set_state(state);
    }

    pub fn get_segment_state(&self, segment: SegmentId) -> SegmentState {
        self.info(segment).state()
    }

    /// SSD -> VICTIM, unless the segment got freed (or promoted) since the
    /// caller looked at it.  Returns whether the promotion happened.
    pub fn try_promote_victim(&self, segment: SegmentId) -> bool {
        let info = self.info(segment);
        let mut state = info.lock_state();
        if *state == SegmentState::Ssd {
            *state = SegmentState::Victim;
            true
        } else {
            debug!(
                "segment {} is {:?}, not promoting to victim",
                segment, *state
            );
            false
        }
    }

    pub fn allocate_free_segment(&self) -> Option<SegmentId> {
        let segment = self.free_bitmap.allocate_first_clear()?;
        // The set bit reserves the segment, so nobody else can race this
        // FREE -> NVRAM transition.
        self.info(segment).set_state(SegmentState::Nvram);
        trace!("allocated segment {}", segment);
        Some(segment)
    }

    pub fn num_free_segments(&self) -> u64 {
        let _guard = self.ctx_lock.lock().unwrap();
        self.free_bitmap.num_clear()
    }

    pub fn num_free_segments_weak(&self) -> u64 {
        self.free_bitmap.num_clear_weak()
    }

    /// GC victim picker: the SSD-state segment with the fewest valid blocks,
    /// lowest id winning ties.
    pub fn find_most_invalid_ssd_segment(&self) -> Option<SegmentId> {
        let mut victim: Option<(SegmentId, u32)> = None;
        for (index, info) in self.segment_infos.iter().enumerate() {
            if info.state() != SegmentState::Ssd {
                continue;
            }
            let valid = info.valid_blocks();
            if victim.map_or(true, |(_, best)| valid < best) {
                victim = Some((SegmentId(index as u32), valid));
            }
        }
        victim.map(|(segment, _)| segment)
    }

    /// Every segment the rebuild process must reconstruct: anything that has
    /// made it to the SSD (including GC victims mid-reclaim).
    pub fn collect_rebuild_candidates(&self) -> Vec<SegmentId> {
        self.segment_infos
            .iter()
            .enumerate()
            .filter(|(_, info)| {
                matches!(info.state(), SegmentState::Ssd | SegmentState::Victim)
            })
            .map(|(index, _)| SegmentId(index as u32))
            .collect()
    }

    /// Journal replay: re-mark a segment as allocated.  Idempotent, since a
    /// segment allocation may be replayed more than once.
    pub fn replay_segment_allocation(&self, segment: SegmentId) {
        if self.free_bitmap.is_allocated(segment) {
            return;
        }
        self.free_bitmap.mark_allocated(segment);
        let info = self.info(segment);
        let mut state = info.lock_state();
        if *state == SegmentState::Free {
            *state = SegmentState::Nvram;
        }
    }

    fn bitmap_words(&self) -> usize {
        usize::from64(u64::from(self.geometry.num_user_segments).div_ceil(64))
    }
}

impl ContextIoClient for SegmentCtx {
    fn signature(&self) -> u32 {
        SIG_SEGMENT_CTX
    }

    fn filename(&self) -> &'static str {
        SEGMENT_CTX_FILENAME
    }

    fn num_sections(&self) -> usize {
        NUM_SECTIONS
    }

    fn section_size(&self, section: usize) -> usize {
        match section {
            SECTION_HEADER => CTX_HEADER_SIZE,
            SECTION_SEGMENT_INFO => SEGMENT_INFO_PHYS_SIZE * self.segment_infos.len(),
            SECTION_FREE_BITMAP => BITMAP_WORD_SIZE * self.bitmap_words(),
            _ => panic!("invalid segment context section {}", section),
        }
    }

    fn before_flush(&self, buf: &mut Vec<u8>) {
        let version = self.dirty_version.fetch_add(1, Ordering::SeqCst);
        ondisk_encode_into(
            buf,
            &SegmentCtxHeaderPhys {
                sig: SIG_SEGMENT_CTX,
                version,
                num_sections: NUM_SECTIONS as u32,
            },
        );
        for info in &self.segment_infos {
            ondisk_encode_into(
                buf,
                &SegmentInfoPhys {
                    valid_blocks: info.valid_blocks(),
                    occupied_stripes: info.occupied_stripes(),
                    state: info.state() as u8,
                },
            );
        }
        for word in self.free_bitmap.to_allocated_words() {
            ondisk_encode_into(buf, &word);
        }
        trace!("ready to flush segment context version {}", version);
    }

    fn after_load(&self, buf: &[u8]) -> AllocResult<()> {
        let header: SegmentCtxHeaderPhys = ondisk_decode(buf)
            .map_err(|e| AllocError::LoadCorrupt(format!("segment context header: {}", e)))?;
        if header.sig != SIG_SEGMENT_CTX {
            return Err(AllocError::LoadCorrupt(format!(
                "segment context signature mismatch: {:#x}",
                header.sig
            )));
        }
        if buf.len() != self.total_size() {
            return Err(AllocError::LoadCorrupt(format!(
                "segment context is {} bytes, expected {}",
                buf.len(),
                self.total_size()
            )));
        }

        let mut offset = CTX_HEADER_SIZE;
        let mut num_free = 0u64;
        for info in &self.segment_infos {
            let phys: SegmentInfoPhys = ondisk_decode(&buf[offset..])
                .map_err(|e| AllocError::LoadCorrupt(format!("segment info: {}", e)))?;
            offset += SEGMENT_INFO_PHYS_SIZE;
            let state = SegmentState::try_from(phys.state).map_err(|s| {
                AllocError::LoadCorrupt(format!("invalid segment state {}", s))
            })?;
            info.reset_counters(phys.valid_blocks, phys.occupied_stripes);
            info.force_state(state);
            if state == SegmentState::Free {
                num_free += 1;
            }
        }

        let mut words = Vec::with_capacity(self.bitmap_words());
        for _ in 0..self.bitmap_words() {
            let word: u64 = ondisk_decode(&buf[offset..])
                .map_err(|e| AllocError::LoadCorrupt(format!("free bitmap: {}", e)))?;
            offset += BITMAP_WORD_SIZE;
            words.push(word);
        }
        self.free_bitmap.load_allocated_words(&words);

        // A FREE segment must have a clear bit, and vice versa.
        if self.free_bitmap.num_clear() != num_free {
            return Err(AllocError::LoadCorrupt(format!(
                "free bitmap has {} clear bits but {} segments are FREE",
                self.free_bitmap.num_clear(),
                num_free
            )));
        }
        for (index, info) in self.segment_infos.iter().enumerate() {
            let segment = SegmentId(index as u32);
            if (info.state() == SegmentState::Free) == self.free_bitmap.is_allocated(segment) {
                return Err(AllocError::LoadCorrupt(format!(
                    "segment {} state {:?} disagrees with the free bitmap",
                    segment,
                    info.state()
                )));
            }
        }

        self.stored_version.store(header.version, Ordering::SeqCst);
        self.dirty_version.store(header.version + 1, Ordering::SeqCst);
        debug!(
            "segment context loaded: version {}, {} free segments",
            header.version, num_free
        );
        Ok(())
    }

    fn finalize_io(&self, buf: &[u8]) {
        let header: SegmentCtxHeaderPhys = ondisk_decode(buf).unwrap();
        self.stored_version.store(header.version, Ordering::SeqCst);
        debug!("segment context stored, version {}", header.version);
    }

    fn stored_version(&self) -> u64 {
        self.stored_version.load(Ordering::SeqCst)
    }

    fn dirty_version(&self) -> u64 {
        self.dirty_version.load(Ordering::SeqCst)
    }

    fn reset_dirty_version(&self) {
        self.dirty_version.store(0, Ordering::SeqCst);
    }
}
