use crate::allocator_ctx::AllocatorCtx;
use crate::base_types::*;
use crate::block_alloc_status::BlockAllocationStatus;
use crate::context_io::{ContextIoManager, ContextOwner, FlushCallback, IoType};
use crate::context_replayer::ContextReplayer;
use crate::error::{AllocError, AllocResult};
use crate::event_scheduler::EventScheduler;
use crate::gc_ctx::{GcCtx, GcMode};
use crate::meta_io::MetaIo;
use crate::rebuild_ctx::RebuildCtx;
use crate::segment_ctx::SegmentCtx;
use crate::telemetry::{
    MetricKind, TelemetryPublisher, ALCT_FREE_SEGMENT_COUNT, ALCT_GC_MODE,
    ALCT_GC_VICTIM_SEGMENT, ALCT_LAST_ALLOCATED_SEGMENT,
};
use log::*;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// The orchestrator over the four sub-contexts.  Exposes the public
/// allocator contract and enforces the cross-context ordering: a freed
/// segment is reconciled with the rebuild set, the GC mode is re-evaluated,
/// and user block allocation is re-admitted, in that order.
pub struct ContextManager {
    geometry: Geometry,
    segment_ctx: Arc<SegmentCtx>,
    allocator_ctx: Arc<AllocatorCtx>,
    rebuild_ctx: Arc<RebuildCtx>,
    gc_ctx: GcCtx,
    block_alloc_status: Arc<BlockAllocationStatus>,
    io_manager: Arc<ContextIoManager>,
    replayer: ContextReplayer,
    telemetry: Arc<dyn TelemetryPublisher>,
    // Cached mode; swapped only inside get_current_gc_mode so that the
    // before/after comparison driving telemetry is race-free.
    cur_gc_mode: AtomicU8,
    // Coarse lock for rebuild-affecting orchestration.
    ctx_lock: Mutex<()>,
}

impl ContextManager {
    pub fn new(
        geometry: Geometry,
        gc_ctx: GcCtx,
        meta_io: Arc<dyn MetaIo>,
        telemetry: Arc<dyn TelemetryPublisher>,
        scheduler: Arc<dyn EventScheduler>,
    ) -> ContextManager {
        let segment_ctx = Arc::new(SegmentCtx::new(geometry));
        let allocator_ctx = Arc::new(AllocatorCtx::new(geometry));
        let rebuild_ctx = Arc::new(RebuildCtx::new(geometry));
        let io_manager = Arc::new(ContextIoManager::new(
            segment_ctx.clone(),
            allocator_ctx.clone(),
            rebuild_ctx.clone(),
            meta_io,
            scheduler,
        ));
        let replayer =
            ContextReplayer::new(segment_ctx.clone(), allocator_ctx.clone(), geometry);
        ContextManager {
            geometry,
            segment_ctx,
            allocator_ctx,
            rebuild_ctx,
            gc_ctx,
            block_alloc_status: Arc::new(BlockAllocationStatus::default()),
            io_manager,
            replayer,
            telemetry,
            cur_gc_mode: AtomicU8::new(GcMode::NoGc as u8),
            ctx_lock: Mutex::new(()),
        }
    }

    /// Load (or create) the durable contexts.
    pub async fn init(&self) -> AllocResult<()> {
        self.io_manager.init().await?;
        info!(
            "context manager initialized: {} segments, {} free",
            self.geometry.num_user_segments,
            self.segment_ctx.num_free_segments()
        );
        Ok(())
    }

    /// Quiesce outstanding context I/O and tear down.
    pub async fn dispose(&self) {
        self.io_manager.dispose().await;
        self.rebuild_ctx.clear_rebuild_target_list();
        info!("context manager disposed");
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn segment_ctx(&self) -> &Arc<SegmentCtx> {
        &self.segment_ctx
    }

    pub fn allocator_ctx(&self) -> &Arc<AllocatorCtx> {
        &self.allocator_ctx
    }

    pub fn rebuild_ctx(&self) -> &Arc<RebuildCtx> {
        &self.rebuild_ctx
    }

    pub fn gc_ctx(&self) -> &GcCtx {
        &self.gc_ctx
    }

    pub fn block_allocation_status(&self) -> &Arc<BlockAllocationStatus> {
        &self.block_alloc_status
    }

    pub fn replayer(&self) -> &ContextReplayer {
        &self.replayer
    }

    // ---- write path -----------------------------------------------------

    pub fn increase_valid_block_count(&self, segment: SegmentId, count: u32) -> u32 {
        self.segment_ctx.increase_valid_block_count(segment, count)
    }

    pub fn decrease_valid_block_count(&self, segment: SegmentId, count: u32) {
        if self.segment_ctx.decrease_valid_block_count(segment, count) {
            debug!("segment {} freed by valid block count", segment);
            self.notify_segment_freed(segment);
        }
    }

    /// A stripe of `lsid`'s segment finished writing.
    pub fn update_occupied_stripe_count(&self, lsid: StripeId) {
        let segment = self.geometry.segment_of(lsid);
        if self.segment_ctx.increase_occupied_stripe_count(segment) {
            debug!("segment {} freed by occupied stripe count", segment);
            self.notify_segment_freed(segment);
        }
    }

    fn notify_segment_freed(&self, segment: SegmentId) {
        let num_free = self.segment_ctx.num_free_segments_weak();
        info!(
            "segment {} was freed, free segment count {}",
            segment, num_free
        );
        if self.rebuild_ctx.free_segment_in_rebuild_target(segment) {
            self.io_manager.flush_rebuild_context_background(None);
        }
        if self.get_current_gc_mode() != GcMode::Urgent {
            self.block_alloc_status.permit_user_block_allocation();
        }
        self.telemetry
            .publish(ALCT_FREE_SEGMENT_COUNT, MetricKind::Gauge, num_free as i64);
    }

    // ---- allocation path ------------------------------------------------

    pub fn allocate_free_segment(&self) -> Option<SegmentId> {
        let segment = self.segment_ctx.allocate_free_segment();
        match segment {
            Some(segment) => {
                let num_free = self.segment_ctx.num_free_segments_weak();
                info!(
                    "allocated segment {}, free segment count {}",
                    segment, num_free
                );
                self.telemetry.publish(
                    ALCT_LAST_ALLOCATED_SEGMENT,
                    MetricKind::Gauge,
                    i64::from(segment.0),
                );
                self.telemetry.publish(
                    ALCT_FREE_SEGMENT_COUNT,
                    MetricKind::Gauge,
                    num_free as i64,
                );
            }
            None => {
                warn!("no free segment to allocate");
            }
        }
        segment
    }

    /// Allocate a free segment and snap the SSD write cursor to its first
    /// stripe.
    pub fn set_next_ssd_lsid(&self) -> AllocResult<()> {
        let segment = self
            .allocate_free_segment()
            .ok_or(AllocError::NoFreeSegment)?;
        self.allocator_ctx.set_next_ssd_lsid(segment);
        Ok(())
    }

    // ---- GC path --------------------------------------------------------

    /// Promote the most-invalid SSD segment to VICTIM.  Retries if a racing
    /// free invalidates the pick.
    pub fn allocate_gc_victim_segment(&self) -> Option<SegmentId> {
        loop {
            let victim = self.segment_ctx.find_most_invalid_ssd_segment()?;
            if !self.segment_ctx.try_promote_victim(victim) {
                continue;
            }
            info!(
                "gc victim segment {}, free segment count {}",
                victim,
                self.segment_ctx.num_free_segments_weak()
            );
            self.telemetry.publish(
                ALCT_GC_VICTIM_SEGMENT,
                MetricKind::Gauge,
                i64::from(victim.0),
            );
            return Some(victim);
        }
    }

    pub fn get_current_gc_mode(&self) -> GcMode {
        let num_free = self.segment_ctx.num_free_segments();
        let mode = self.gc_ctx.current_gc_mode(num_free);
        if mode == GcMode::Urgent {
            self.block_alloc_status.prohibit_user_block_allocation();
        }
        let prev = self.cur_gc_mode.swap(mode as u8, Ordering::SeqCst);
        if GcMode::try_from(prev).unwrap() != mode {
            info!("gc mode {:?} -> {:?} ({} free segments)",
                GcMode::try_from(prev).unwrap(), mode, num_free);
            self.telemetry
                .publish(ALCT_GC_MODE, MetricKind::Gauge, mode as i64);
        }
        mode
    }

    pub fn get_gc_threshold(&self, mode: GcMode) -> u32 {
        self.gc_ctx.gc_threshold(mode)
    }

    pub fn get_num_of_free_segment(&self, needs_lock: bool) -> u64 {
        if needs_lock {
            self.segment_ctx.num_free_segments()
        } else {
            self.segment_ctx.num_free_segments_weak()
        }
    }

    // ---- rebuild path ---------------------------------------------------

    /// Snapshot every SSD/VICTIM segment into the rebuild target set and
    /// kick off a rebuild-context flush.  Returns the number of targets.
    pub fn make_rebuild_target(&self) -> usize {
        let candidates = self.segment_ctx.collect_rebuild_candidates();
        if candidates.is_empty() {
            info!("nothing to rebuild");
            return 0;
        }
        let count = self.rebuild_ctx.make_target_segments(&candidates);
        info!("{} segments marked as rebuild targets", count);
        self.io_manager.flush_rebuild_context_background(None);
        count
    }

    pub fn allocate_rebuild_target_segment(&self) -> Option<SegmentId> {
        self.rebuild_ctx.get_rebuild_target_segment()
    }

    pub fn release_rebuild_segment(&self, segment: SegmentId) {
        if self.rebuild_ctx.release_rebuild_segment(segment) {
            self.io_manager.flush_rebuild_context_background(None);
        }
    }

    pub fn stop_rebuilding(&self) -> AllocResult<()> {
        let _guard = self.ctx_lock.lock().unwrap();
        info!("stop rebuilding");
        self.rebuild_ctx.stop_rebuilding()?;
        self.io_manager.flush_rebuild_context_background(None);
        Ok(())
    }

    pub fn need_rebuild_again(&self) -> bool {
        self.rebuild_ctx.need_rebuild_again()
    }

    pub fn get_rebuild_target_segment_count(&self) -> usize {
        self.rebuild_ctx.target_segment_count()
    }

    // ---- durability -----------------------------------------------------

    pub async fn flush_contexts(
        &self,
        callback: Option<FlushCallback>,
        sync: bool,
    ) -> AllocResult<()> {
        self.io_manager.flush_contexts(callback, sync).await
    }

    pub async fn wait_pending_io(&self, io_type: IoType) {
        self.io_manager.wait_pending_io(io_type).await
    }

    pub fn get_stored_context_version(&self, owner: ContextOwner) -> u64 {
        self.io_manager.get_stored_context_version(owner)
    }
}
