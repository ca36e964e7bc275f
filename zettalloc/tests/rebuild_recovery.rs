mod common;

use common::*;
use more_asserts::*;
use std::sync::Arc;
use zettalloc::base_types::{Geometry, SegmentId};
use zettalloc::event_scheduler::InlineScheduler;
use zettalloc::meta_io::{MemMetaIo, MetaIo};
use zettalloc::telemetry::NullTelemetry;
use zettalloc::{AllocError, ContextManager, ContextOwner, GcCtx, IoType, SegmentState};

fn rebuild_geometry(num_user_segments: u32) -> Geometry {
    Geometry {
        stripes_per_segment: 8,
        blocks_per_stripe: 4,
        num_user_segments,
    }
}

#[tokio::test]
async fn test_rebuild_vs_gc_race() {
    let array = new_array(rebuild_geometry(10), 3, 1).await;
    let manager = &array.manager;

    for _ in 0..8 {
        manager.allocate_free_segment().unwrap();
    }
    for segment in [SegmentId(5), SegmentId(7)] {
        manager
            .segment_ctx()
            .set_segment_state(segment, SegmentState::Ssd);
    }

    assert_eq!(manager.make_rebuild_target(), 2);
    assert_eq!(
        manager.allocate_rebuild_target_segment(),
        Some(SegmentId(5))
    );

    // GC frees segment 7: dropped from the target set.
    free_segment_via_invalidation(&array, SegmentId(7));
    assert!(!manager.rebuild_ctx().is_rebuild_target_segment(SegmentId(7)));
    assert_eq!(manager.get_rebuild_target_segment_count(), 1);

    // GC frees segment 5, the segment rebuild is operating on right now:
    // it stays listed until the worker releases it.
    free_segment_via_invalidation(&array, SegmentId(5));
    assert!(manager.rebuild_ctx().is_rebuild_target_segment(SegmentId(5)));
    assert_eq!(
        manager.segment_ctx().get_segment_state(SegmentId(5)),
        SegmentState::Free
    );

    manager.release_rebuild_segment(SegmentId(5));
    assert_eq!(manager.get_rebuild_target_segment_count(), 0);

    manager.wait_pending_io(IoType::All).await;
    assert_ge!(
        manager.get_stored_context_version(ContextOwner::RebuildCtx),
        1
    );
}

#[tokio::test]
async fn test_release_unknown_segment_is_noop() {
    let array = new_array(rebuild_geometry(10), 3, 1).await;
    let manager = &array.manager;

    manager.allocate_free_segment().unwrap();
    manager
        .segment_ctx()
        .set_segment_state(SegmentId(0), SegmentState::Ssd);
    assert_eq!(manager.make_rebuild_target(), 1);

    // GC won the race long ago; releasing an absent id succeeds quietly.
    manager.release_rebuild_segment(SegmentId(9));
    assert_eq!(manager.get_rebuild_target_segment_count(), 1);
}

#[tokio::test]
async fn test_crash_recovery_roundtrip() {
    let meta_io = Arc::new(MemMetaIo::new());
    {
        let array = open_array(rebuild_geometry(20), 3, 1, meta_io.clone()).await;
        let manager = &array.manager;
        for _ in 0..18 {
            manager.allocate_free_segment().unwrap();
        }
        for segment in [SegmentId(3), SegmentId(9), SegmentId(17)] {
            manager
                .segment_ctx()
                .set_segment_state(segment, SegmentState::Ssd);
        }
        assert_eq!(manager.make_rebuild_target(), 3);
        manager.flush_contexts(None, true).await.unwrap();
        manager.dispose().await;
    }

    // A fresh core over the same metadata picks the rebuild back up.
    let array = open_array(rebuild_geometry(20), 3, 1, meta_io).await;
    let manager = &array.manager;
    assert!(manager.need_rebuild_again());
    assert_eq!(manager.get_rebuild_target_segment_count(), 3);
    assert_eq!(
        manager.allocate_rebuild_target_segment(),
        Some(SegmentId(3))
    );
    assert_eq!(manager.get_num_of_free_segment(true), 2);
    assert_eq!(
        manager.segment_ctx().get_segment_state(SegmentId(17)),
        SegmentState::Ssd
    );
}

#[tokio::test]
async fn test_stop_rebuilding() {
    let array = new_array(rebuild_geometry(10), 3, 1).await;
    let manager = &array.manager;

    manager.allocate_free_segment().unwrap();
    manager
        .segment_ctx()
        .set_segment_state(SegmentId(0), SegmentState::Ssd);
    assert_eq!(manager.make_rebuild_target(), 1);

    manager.stop_rebuilding().unwrap();
    assert_eq!(manager.get_rebuild_target_segment_count(), 0);
    assert_eq!(manager.stop_rebuilding(), Err(AllocError::RebuildSetEmpty));
}

#[tokio::test]
async fn test_corrupt_context_file_rejected_at_init() {
    let meta_io = Arc::new(MemMetaIo::new());
    {
        let array = open_array(rebuild_geometry(10), 3, 1, meta_io.clone()).await;
        array.manager.dispose().await;
    }
    meta_io
        .write("SegmentContext", &[0u8; 64])
        .await
        .unwrap();

    let manager = ContextManager::new(
        rebuild_geometry(10),
        GcCtx::new(3, 1),
        meta_io,
        Arc::new(NullTelemetry),
        Arc::new(InlineScheduler),
    );
    assert!(matches!(
        manager.init().await,
        Err(AllocError::LoadCorrupt(_))
    ));
}
