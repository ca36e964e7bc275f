#![allow(dead_code)]

use std::sync::Arc;
use zettalloc::base_types::Geometry;
use zettalloc::event_scheduler::InlineScheduler;
use zettalloc::meta_io::MemMetaIo;
use zettalloc::telemetry::RecordingTelemetry;
use zettalloc::{ContextManager, GcCtx};

pub struct TestArray {
    pub manager: ContextManager,
    pub meta_io: Arc<MemMetaIo>,
    pub telemetry: Arc<RecordingTelemetry>,
}

pub fn small_geometry() -> Geometry {
    Geometry {
        stripes_per_segment: 8,
        blocks_per_stripe: 4,
        num_user_segments: 4,
    }
}

/// Fresh array over fresh (empty) metadata storage.
pub async fn new_array(geometry: Geometry, normal: u32, urgent: u32) -> TestArray {
    open_array(geometry, normal, urgent, Arc::new(MemMetaIo::new())).await
}

/// Array over existing metadata storage; this is the "reboot" path.
pub async fn open_array(
    geometry: Geometry,
    normal: u32,
    urgent: u32,
    meta_io: Arc<MemMetaIo>,
) -> TestArray {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let manager = ContextManager::new(
        geometry,
        GcCtx::new(normal, urgent),
        meta_io.clone(),
        telemetry.clone(),
        Arc::new(InlineScheduler),
    );
    manager.init().await.unwrap();
    TestArray {
        manager,
        meta_io,
        telemetry,
    }
}

/// Walk `segment` through the write path until it is reclaimable, then
/// invalidate everything so it frees: fill the valid-block count, complete
/// every stripe, flip it to SSD, and decrement the blocks away.
pub fn free_segment_via_invalidation(array: &TestArray, segment: zettalloc::base_types::SegmentId) {
    let geometry = array.manager.geometry();
    let blocks = geometry.blocks_per_segment();
    array.manager.increase_valid_block_count(segment, blocks);
    if array.manager.segment_ctx().get_segment_state(segment) == zettalloc::SegmentState::Nvram {
        array
            .manager
            .segment_ctx()
            .set_segment_state(segment, zettalloc::SegmentState::Ssd);
    }
    let first = geometry.first_stripe_of(segment);
    for stripe in first.0..first.0 + geometry.stripes_per_segment {
        array
            .manager
            .update_occupied_stripe_count(zettalloc::base_types::StripeId(stripe));
    }
    array.manager.decrease_valid_block_count(segment, blocks);
}
