use crate::base_types::*;
use crate::context_io::ContextIoClient;
use crate::error::{AllocError, AllocResult};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub const SIG_REBUILD_CTX: u32 = 0xCFCF_CFCF;
pub const REBUILD_CTX_FILENAME: &str = "RebuildContext";

const SECTION_HEADER: usize = 0;
const SECTION_SEGMENT_LIST: usize = 1;
const NUM_SECTIONS: usize = 2;

const SEGMENT_ID_SIZE: usize = 4;

#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
struct RebuildCtxHeaderPhys {
    sig: u32,
    version: u64,
    num_target_segments: u32,
}
impl OnDisk for RebuildCtxHeaderPhys {}

/// Segments awaiting background reconstruction after a device failure.
/// Lowest id rebuilds first.  `current` is the segment the rebuild worker is
/// operating on right now; a GC free of that segment must not yank it out
/// from under the worker (removal is deferred to release).
pub struct RebuildCtx {
    inner: Mutex<RebuildTargets>,
    dirty_version: AtomicU64,
    stored_version: AtomicU64,
    need_continue: AtomicBool,
    num_user_segments: u32,
}

struct RebuildTargets {
    targets: BTreeSet<SegmentId>,
    current: Option<SegmentId>,
}

impl RebuildCtx {
    pub fn new(geometry: Geometry) -> RebuildCtx {
        RebuildCtx {
            inner: Mutex::new(RebuildTargets {
                targets: BTreeSet::new(),
                current: None,
            }),
            dirty_version: AtomicU64::new(0),
            stored_version: AtomicU64::new(0),
            need_continue: AtomicBool::new(false),
            num_user_segments: geometry.num_user_segments,
        }
    }

    pub fn add_rebuild_target_segment(&self, segment: SegmentId) {
        let mut inner = self.inner.lock().unwrap();
        Self::insert_target(&mut inner.targets, segment);
    }

    fn insert_target(targets: &mut BTreeSet<SegmentId>, segment: SegmentId) {
        if targets.insert(segment) {
            info!("segment {} inserted as rebuild target", segment);
        } else {
            error!("segment {} is already a rebuild target, ignored", segment);
        }
    }

    /// Snapshot a batch of targets under one lock acquisition; returns the
    /// resulting set size.
    pub fn make_target_segments(&self, segments: &[SegmentId]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        for &segment in segments {
            Self::insert_target(&mut inner.targets, segment);
        }
        inner.targets.len()
    }

    /// Pick the next segment to rebuild (the smallest id) and record it as
    /// the in-flight target.  Empty set clears the in-flight target.
    pub fn get_rebuild_target_segment(&self) -> Option<SegmentId> {
        let mut inner = self.inner.lock().unwrap();
        match inner.targets.iter().next().copied() {
            Some(segment) => {
                inner.current = Some(segment);
                Some(segment)
            }
            None => {
                info!("no segment left to rebuild");
                inner.current = None;
                None
            }
        }
    }

    /// Rebuild of `segment` finished.  Returns whether the durable set
    /// changed (i.e. a flush is needed).  An unknown id means GC freed the
    /// segment mid-rebuild; that is a successful no-op.
    pub fn release_rebuild_segment(&self, segment: SegmentId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.targets.remove(&segment) {
            warn!(
                "segment {} is not in the rebuild target set, seems to have been freed by GC",
                segment
            );
            inner.current = None;
            return false;
        }
        if inner.current == Some(segment) {
            inner.current = None;
        }
        info!("segment {} rebuild done", segment);
        true
    }

    /// A segment was freed (by GC or the write path).  Drop it from the
    /// target set unless it is the in-flight target, in which case the
    /// rebuild worker still owns it and release will clean up.  Returns
    /// whether the durable set changed.
    pub fn free_segment_in_rebuild_target(&self, segment: SegmentId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.targets.contains(&segment) {
            return false;
        }
        if inner.current == Some(segment) {
            info!(
                "segment {} reclaimed by GC but still under rebuild, keeping it listed",
                segment
            );
            return false;
        }
        inner.targets.remove(&segment);
        info!("segment {} dropped from rebuild targets, freed by GC", segment);
        true
    }

    pub fn stop_rebuilding(&self) -> AllocResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.targets.is_empty() {
            info!("rebuild already done or never started");
            return Err(AllocError::RebuildSetEmpty);
        }
        inner.targets.clear();
        inner.current = None;
        Ok(())
    }

    /// True iff the persisted target set was non-empty at load, i.e. a
    /// rebuild was interrupted and must be resumed.
    pub fn need_rebuild_again(&self) -> bool {
        self.need_continue.load(Ordering::SeqCst)
    }

    pub fn is_rebuild_target_segment(&self, segment: SegmentId) -> bool {
        self.inner.lock().unwrap().targets.contains(&segment)
    }

    pub fn target_segment_count(&self) -> usize {
        self.inner.lock().unwrap().targets.len()
    }

    /// Dispose-time check: a non-empty set here means rebuild never drained.
    pub fn clear_rebuild_target_list(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.targets.is_empty() {
            warn!("rebuild target set is not empty at teardown");
            for segment in &inner.targets {
                warn!("leftover rebuild target segment {}", segment);
            }
            inner.targets.clear();
        }
        inner.current = None;
    }
}

impl ContextIoClient for RebuildCtx {
    fn signature(&self) -> u32 {
        SIG_REBUILD_CTX
    }

    fn filename(&self) -> &'static str {
        REBUILD_CTX_FILENAME
    }

    fn num_sections(&self) -> usize {
        NUM_SECTIONS
    }

    fn section_size(&self, section: usize) -> usize {
        match section {
            SECTION_HEADER => CTX_HEADER_SIZE,
            // Capacity of the list section; a flush writes only the live
            // prefix.
            SECTION_SEGMENT_LIST => SEGMENT_ID_SIZE * self.num_user_segments as usize,
            _ => panic!("invalid rebuild context section {}", section),
        }
    }

    fn before_flush(&self, buf: &mut Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        let version = self.dirty_version.fetch_add(1, Ordering::SeqCst);
        ondisk_encode_into(
            buf,
            &RebuildCtxHeaderPhys {
                sig: SIG_REBUILD_CTX,
                version,
                num_target_segments: inner.targets.len() as u32,
            },
        );
        for segment in &inner.targets {
            ondisk_encode_into(buf, segment);
        }
        debug!(
            "ready to flush rebuild context version {}, {} target segments",
            version,
            inner.targets.len()
        );
    }

    fn after_load(&self, buf: &[u8]) -> AllocResult<()> {
        let header: RebuildCtxHeaderPhys = ondisk_decode(buf)
            .map_err(|e| AllocError::LoadCorrupt(format!("rebuild context header: {}", e)))?;
        if header.sig != SIG_REBUILD_CTX {
            return Err(AllocError::LoadCorrupt(format!(
                "rebuild context signature mismatch: {:#x}",
                header.sig
            )));
        }
        let count = header.num_target_segments as usize;
        if count > self.num_user_segments as usize
            || buf.len() != CTX_HEADER_SIZE + SEGMENT_ID_SIZE * count
        {
            return Err(AllocError::LoadCorrupt(format!(
                "rebuild context is {} bytes for {} targets",
                buf.len(),
                count
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.targets.clear();
        inner.current = None;
        let mut offset = CTX_HEADER_SIZE;
        for _ in 0..count {
            let segment: SegmentId = ondisk_decode(&buf[offset..])
                .map_err(|e| AllocError::LoadCorrupt(format!("rebuild target: {}", e)))?;
            offset += SEGMENT_ID_SIZE;
            if !inner.targets.insert(segment) {
                return Err(AllocError::LoadCorrupt(format!(
                    "segment {} is listed twice in the rebuild context",
                    segment
                )));
            }
        }

        self.stored_version.store(header.version, Ordering::SeqCst);
        self.dirty_version.store(header.version + 1, Ordering::SeqCst);
        if !inner.targets.is_empty() {
            self.need_continue.store(true, Ordering::SeqCst);
        }
        debug!(
            "rebuild context loaded: version {}, {} target segments",
            header.version,
            inner.targets.len()
        );
        Ok(())
    }

    fn finalize_io(&self, buf: &[u8]) {
        let header: RebuildCtxHeaderPhys = ondisk_decode(buf).unwrap();
        self.stored_version.store(header.version, Ordering::SeqCst);
        debug!(
            "rebuild context stored, version {}, {} target segments",
            header.version, header.num_target_segments
        );
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

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            stripes_per_segment: 8,
            blocks_per_stripe: 4,
            num_user_segments: 64,
        }
    }

    fn ctx_with_targets(targets: &[u32]) -> RebuildCtx {
        let ctx = RebuildCtx::new(geometry());
        for &t in targets {
            ctx.add_rebuild_target_segment(SegmentId(t));
        }
        ctx
    }

    #[test]
    fn test_lowest_id_first() {
        let ctx = ctx_with_targets(&[7, 5]);
        assert_eq!(ctx.get_rebuild_target_segment(), Some(SegmentId(5)));
        assert!(ctx.release_rebuild_segment(SegmentId(5)));
        assert_eq!(ctx.get_rebuild_target_segment(), Some(SegmentId(7)));
        assert!(ctx.release_rebuild_segment(SegmentId(7)));
        assert_eq!(ctx.get_rebuild_target_segment(), None);
    }

    #[test]
    fn test_duplicate_insert_ignored() {
        let ctx = ctx_with_targets(&[3, 3, 3]);
        assert_eq!(ctx.target_segment_count(), 1);
    }

    #[test]
    fn test_gc_free_of_current_target_is_deferred() {
        let ctx = ctx_with_targets(&[5, 7]);
        assert_eq!(ctx.get_rebuild_target_segment(), Some(SegmentId(5)));
        // GC frees 7: dropped from the set, flush needed.
        assert!(ctx.free_segment_in_rebuild_target(SegmentId(7)));
        // GC frees 5, the in-flight target: kept, no flush.
        assert!(!ctx.free_segment_in_rebuild_target(SegmentId(5)));
        assert!(ctx.is_rebuild_target_segment(SegmentId(5)));
        // The rebuild worker finishes 5: now it is removed.
        assert!(ctx.release_rebuild_segment(SegmentId(5)));
        assert_eq!(ctx.target_segment_count(), 0);
    }

    #[test]
    fn test_release_unknown_segment_is_noop() {
        let ctx = ctx_with_targets(&[2]);
        ctx.get_rebuild_target_segment();
        assert!(!ctx.release_rebuild_segment(SegmentId(9)));
        assert_eq!(ctx.target_segment_count(), 1);
    }

    #[test]
    fn test_stop_rebuilding() {
        let ctx = ctx_with_targets(&[1, 2]);
        ctx.stop_rebuilding().unwrap();
        assert_eq!(ctx.target_segment_count(), 0);
        assert_eq!(ctx.stop_rebuilding(), Err(AllocError::RebuildSetEmpty));
    }

    #[test]
    fn test_flush_load_roundtrip() {
        let ctx = ctx_with_targets(&[3, 9, 17]);
        let mut buf = Vec::new();
        ctx.before_flush(&mut buf);
        assert_eq!(buf.len(), CTX_HEADER_SIZE + 3 * SEGMENT_ID_SIZE);

        let restored = RebuildCtx::new(geometry());
        assert!(!restored.need_rebuild_again());
        restored.after_load(&buf).unwrap();
        assert!(restored.need_rebuild_again());
        assert_eq!(restored.target_segment_count(), 3);
        assert_eq!(restored.get_rebuild_target_segment(), Some(SegmentId(3)));
        assert_eq!(restored.stored_version(), 0);
        assert_eq!(restored.dirty_version(), 1);
    }

    #[test]
    fn test_load_rejects_duplicate_targets() {
        let ctx = ctx_with_targets(&[4]);
        let mut buf = Vec::new();
        ctx.before_flush(&mut buf);
        // Claim two targets and duplicate the single entry.
        let dup = buf[CTX_HEADER_SIZE..CTX_HEADER_SIZE + SEGMENT_ID_SIZE].to_vec();
        buf.extend_from_slice(&dup);
        buf[12..16].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            RebuildCtx::new(geometry()).after_load(&buf),
            Err(AllocError::LoadCorrupt(_))
        ));
    }
}
