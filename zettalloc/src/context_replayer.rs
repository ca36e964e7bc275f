use crate::allocator_ctx::AllocatorCtx;
use crate::base_types::*;
use crate::segment_ctx::SegmentCtx;
use crate::segment_info::SegmentState;
use log::*;
use std::sync::Arc;

/// Rebuilds in-memory allocator state from journal replay after a crash.
/// Replay is single-threaded and mutates memory only; when it finishes, the
/// journal layer pins the reconstructed state with a synchronous
/// `flush_contexts` on the orchestrator.
pub struct ContextReplayer {
    segment_ctx: Arc<SegmentCtx>,
    allocator_ctx: Arc<AllocatorCtx>,
    geometry: Geometry,
}

impl ContextReplayer {
    pub fn new(
        segment_ctx: Arc<SegmentCtx>,
        allocator_ctx: Arc<AllocatorCtx>,
        geometry: Geometry,
    ) -> ContextReplayer {
        ContextReplayer {
            segment_ctx,
            allocator_ctx,
            geometry,
        }
    }

    /// Replay starts from the loaded context files; the versions they carry
    /// are superseded by the journal, so restart the dirty counters.
    pub fn reset_dirty_versions(&self) {
        use crate::context_io::ContextIoClient;
        self.segment_ctx.reset_dirty_version();
        self.allocator_ctx.reset_dirty_version();
    }

    /// A stripe allocation seen in the journal implies its segment was
    /// allocated.  Idempotent across replayed entries of the same segment.
    pub fn replay_segment_allocation(&self, lsid: StripeId) {
        let segment = self.geometry.segment_of(lsid);
        trace!("replay: segment {} allocated (lsid {})", segment, lsid);
        self.segment_ctx.replay_segment_allocation(segment);
    }

    pub fn replay_segment_state(&self, segment: SegmentId, state: SegmentState) {
        trace!("replay: segment {} -> {:?}", segment, state);
        self.segment_ctx.set_segment_state(segment, state);
    }

    pub fn replay_ssd_lsid(&self, lsid: StripeId) {
        trace!("replay: next ssd lsid {:?}", lsid);
        self.allocator_ctx.set_next_ssd_lsid_raw(lsid);
    }

    /// A stripe flush seen in the journal; goes through the regular
    /// occupied-stripe path so a fully-invalidated segment frees here too.
    pub fn replay_stripe_flushed(&self, lsid: StripeId) -> bool {
        let segment = self.geometry.segment_of(lsid);
        let freed = self.segment_ctx.increase_occupied_stripe_count(segment);
        if freed {
            debug!("replay: segment {} freed by stripe flush", segment);
        }
        freed
    }

    pub fn replay_increase_valid_block_count(&self, segment: SegmentId, count: u32) -> u32 {
        self.segment_ctx.increase_valid_block_count(segment, count)
    }

    pub fn replay_decrease_valid_block_count(&self, segment: SegmentId, count: u32) -> bool {
        let freed = self.segment_ctx.decrease_valid_block_count(segment, count);
        if freed {
            debug!("replay: segment {} freed by block invalidation", segment);
        }
        freed
    }

    pub fn reset_active_stripe_tail(&self, slot: usize) {
        trace!("replay: reset active stripe tail {}", slot);
        self.allocator_ctx.reset_active_stripe_tail(slot);
    }

    pub fn replay_active_stripe_tail(&self, slot: usize, tail: VirtualBlockAddr) {
        self.allocator_ctx.set_active_stripe_tail(slot, tail);
    }
}
