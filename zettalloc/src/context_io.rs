use crate::error::{AllocError, AllocResult};
use crate::event_scheduler::EventScheduler;
use crate::meta_io::MetaIo;
use futures::future::join_all;
use log::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::Notify;

/// The three durable context owners.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextOwner {
    SegmentCtx,
    AllocatorCtx,
    RebuildCtx,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoType {
    SegmentCtx,
    AllocatorCtx,
    RebuildCtx,
    All,
}

/// Completion callback for an asynchronous context flush, delivered through
/// the event scheduler.
pub type FlushCallback = Box<dyn FnOnce(AllocResult<()>) + Send + 'static>;

/// The capability every durable context exposes to the I/O manager.  The
/// flush protocol is copy-out: `before_flush` serializes into a buffer the
/// I/O manager owns, so no owner memory is aliased across the I/O boundary.
pub trait ContextIoClient: Send + Sync {
    fn signature(&self) -> u32;
    fn filename(&self) -> &'static str;
    fn num_sections(&self) -> usize;
    fn section_size(&self, section: usize) -> usize;

    /// Upper bound on the serialized size (sections at capacity).
    fn total_size(&self) -> usize {
        (0..self.num_sections()).map(|s| self.section_size(s)).sum()
    }

    /// Serialize the current state into `buf`, bumping the dirty version;
    /// the version written into the header is the one this flush will make
    /// durable.
    fn before_flush(&self, buf: &mut Vec<u8>);

    /// Reconstruct in-memory state from a loaded file.  Verifies the
    /// signature; restores `stored_version` from the header and primes
    /// `dirty_version` to one past it.
    fn after_load(&self, buf: &[u8]) -> AllocResult<()>;

    /// Write completion: adopt the version from the just-written header as
    /// the stored version.
    fn finalize_io(&self, buf: &[u8]);

    fn stored_version(&self) -> u64;
    fn dirty_version(&self) -> u64;
    fn reset_dirty_version(&self);
}

/// Flush/load machinery for one owner.  At most one write per owner is in
/// flight.  Each flush request takes a sequence number; a write pass covers
/// every request made before its snapshot, so concurrent requests coalesce
/// into one write, and every caller waits for a pass that covers its request
/// and returns that pass's result.
pub struct ContextFileIo {
    client: Arc<dyn ContextIoClient>,
    meta_io: Arc<dyn MetaIo>,
    flush_state: Mutex<FlushState>,
    flush_done: Notify,
    pending_io: AtomicU64,
    quiesced: Notify,
}

struct FlushState {
    /// Sequence number handed to the most recent flush request.
    requested: u64,
    /// Highest request sequence covered by a completed write pass
    /// (successful or not).
    flushed: u64,
    /// Outcome of the pass that completed `flushed`.
    last_result: AllocResult<()>,
    /// A write pass is running.
    running: bool,
}

impl ContextFileIo {
    fn new(client: Arc<dyn ContextIoClient>, meta_io: Arc<dyn MetaIo>) -> ContextFileIo {
        ContextFileIo {
            client,
            meta_io,
            flush_state: Mutex::new(FlushState {
                requested: 0,
                flushed: 0,
                last_result: Ok(()),
                running: false,
            }),
            flush_done: Notify::new(),
            pending_io: AtomicU64::new(0),
            quiesced: Notify::new(),
        }
    }

    /// Returns whether a stored file existed.
    async fn load(&self) -> AllocResult<bool> {
        let filename = self.client.filename();
        match self.meta_io.read(filename).await {
            Ok(Some(buf)) => {
                self.client.after_load(&buf)?;
                info!("{} loaded, stored version {}", filename, self.client.stored_version());
                Ok(true)
            }
            Ok(None) => {
                info!("{} does not exist yet", filename);
                Ok(false)
            }
            Err(e) => Err(AllocError::LoadCorrupt(format!(
                "reading {}: {}",
                filename, e
            ))),
        }
    }

    fn begin_io(&self) {
        self.pending_io.fetch_add(1, Ordering::SeqCst);
    }

    fn end_io(&self) {
        if self.pending_io.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.quiesced.notify_waiters();
        }
    }

    /// Callers must bracket this with begin_io()/end_io().
    ///
    /// Returns once a write pass covering this request has completed, with
    /// that pass's result.  A caller that loses the race to write waits for
    /// the winner; if the winner's snapshot predates this request, the
    /// caller runs its own pass once the winner finishes.
    async fn flush_coalesced(&self) -> AllocResult<()> {
        let my_seq = {
            let mut state = self.flush_state.lock().unwrap();
            state.requested += 1;
            state.requested
        };
        loop {
            let became_writer = {
                let mut state = self.flush_state.lock().unwrap();
                if state.flushed >= my_seq {
                    return state.last_result.clone();
                }
                if state.running {
                    false
                } else {
                    state.running = true;
                    true
                }
            };
            if became_writer {
                // Everything requested up to here is covered by the snapshot
                // before_flush is about to take.
                let covered = self.flush_state.lock().unwrap().requested;
                let result = self.flush_once().await;
                {
                    let mut state = self.flush_state.lock().unwrap();
                    state.flushed = covered;
                    state.last_result = result.clone();
                    state.running = false;
                }
                self.flush_done.notify_waiters();
                return result;
            }
            trace!(
                "{} flush waiting on the running pass",
                self.client.filename()
            );
            let notified = self.flush_done.notified();
            {
                let state = self.flush_state.lock().unwrap();
                if state.flushed >= my_seq {
                    return state.last_result.clone();
                }
                if !state.running {
                    // The writer finished between our check and registering;
                    // take another shot at becoming the writer.
                    continue;
                }
            }
            notified.await;
        }
    }

    async fn flush_once(&self) -> AllocResult<()> {
        let filename = self.client.filename();
        let mut buf = Vec::with_capacity(self.client.total_size());
        self.client.before_flush(&mut buf);
        match self.meta_io.write(filename, &buf).await {
            Ok(()) => {
                self.client.finalize_io(&buf);
                Ok(())
            }
            Err(e) => {
                // stored_version stays where it was, so the owner remains
                // dirty and the next flush retries.
                warn!("flush of {} failed: {}", filename, e);
                Err(AllocError::FlushIoFailed(format!("{}: {}", filename, e)))
            }
        }
    }

    async fn wait_pending(&self) {
        loop {
            let notified = self.quiesced.notified();
            if self.pending_io.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Serializes dirty-context flushes to the metadata I/O layer and tracks
/// per-owner stored versions.  No core lock is held across the I/O boundary;
/// owners snapshot into the flush buffer and release their locks before the
/// write is issued.
pub struct ContextIoManager {
    segment_io: Arc<ContextFileIo>,
    allocator_io: Arc<ContextFileIo>,
    rebuild_io: Arc<ContextFileIo>,
    meta_io: Arc<dyn MetaIo>,
    scheduler: Arc<dyn EventScheduler>,
    runtime: Mutex<Option<Handle>>,
}

impl ContextIoManager {
    pub fn new(
        segment: Arc<dyn ContextIoClient>,
        allocator: Arc<dyn ContextIoClient>,
        rebuild: Arc<dyn ContextIoClient>,
        meta_io: Arc<dyn MetaIo>,
        scheduler: Arc<dyn EventScheduler>,
    ) -> ContextIoManager {
        ContextIoManager {
            segment_io: Arc::new(ContextFileIo::new(segment, meta_io.clone())),
            allocator_io: Arc::new(ContextFileIo::new(allocator, meta_io.clone())),
            rebuild_io: Arc::new(ContextFileIo::new(rebuild, meta_io.clone())),
            meta_io,
            scheduler,
            runtime: Mutex::new(None),
        }
    }

    /// Load every context file, creating (flushing) fresh initial state for
    /// any that does not exist yet.
    pub async fn init(&self) -> AllocResult<()> {
        *self.runtime.lock().unwrap() = Some(Handle::current());
        for io in self.select(IoType::All) {
            if !io.load().await? {
                io.begin_io();
                let result = io.flush_coalesced().await;
                io.end_io();
                result?;
            }
        }
        Ok(())
    }

    pub async fn dispose(&self) {
        self.wait_pending_io(IoType::All).await;
        self.meta_io.wait_outstanding().await;
    }

    fn select(&self, io_type: IoType) -> Vec<Arc<ContextFileIo>> {
        match io_type {
            IoType::SegmentCtx => vec![self.segment_io.clone()],
            IoType::AllocatorCtx => vec![self.allocator_io.clone()],
            IoType::RebuildCtx => vec![self.rebuild_io.clone()],
            IoType::All => vec![
                self.segment_io.clone(),
                self.allocator_io.clone(),
                self.rebuild_io.clone(),
            ],
        }
    }

    fn owner_io(&self, owner: ContextOwner) -> &Arc<ContextFileIo> {
        match owner {
            ContextOwner::SegmentCtx => &self.segment_io,
            ContextOwner::AllocatorCtx => &self.allocator_io,
            ContextOwner::RebuildCtx => &self.rebuild_io,
        }
    }

    async fn run_flush(ios: &[Arc<ContextFileIo>]) -> AllocResult<()> {
        // begin_io() has already been called on every entry, so a concurrent
        // wait_pending_io() sees this flush even before the futures run.
        let results = join_all(ios.iter().map(|io| io.flush_coalesced())).await;
        results.into_iter().collect::<AllocResult<Vec<()>>>()?;
        Ok(())
    }

    fn finish(ios: &[Arc<ContextFileIo>]) {
        for io in ios {
            io.end_io();
        }
    }

    fn dispatch(
        &self,
        ios: Vec<Arc<ContextFileIo>>,
        callback: Option<FlushCallback>,
    ) {
        let scheduler = self.scheduler.clone();
        self.runtime_handle().spawn(async move {
            let result = Self::run_flush(&ios).await;
            match callback {
                Some(callback) => {
                    scheduler.enqueue(Box::new(move || callback(result)));
                }
                None => {
                    if let Err(e) = result {
                        error!("background context flush failed: {}", e);
                    }
                }
            }
            // Pending-I/O accounting drops only after the completion
            // callback is on the scheduler, so a quiesce that returns has
            // seen every completion delivered.
            Self::finish(&ios);
        });
    }

    async fn flush(
        &self,
        io_type: IoType,
        callback: Option<FlushCallback>,
        sync: bool,
    ) -> AllocResult<()> {
        let ios = self.select(io_type);
        for io in &ios {
            io.begin_io();
        }
        if sync {
            let result = Self::run_flush(&ios).await;
            if let Some(callback) = callback {
                let delivered = result.clone();
                self.scheduler
                    .enqueue(Box::new(move || callback(delivered)));
            }
            Self::finish(&ios);
            result
        } else {
            self.dispatch(ios, callback);
            Ok(())
        }
    }

    /// Flush every dirty owner.  `sync` blocks until all writes complete;
    /// otherwise the callback (if any) is enqueued on completion.
    pub async fn flush_contexts(
        &self,
        callback: Option<FlushCallback>,
        sync: bool,
    ) -> AllocResult<()> {
        self.flush(IoType::All, callback, sync).await
    }

    pub async fn flush_rebuild_context(
        &self,
        callback: Option<FlushCallback>,
        sync: bool,
    ) -> AllocResult<()> {
        self.flush(IoType::RebuildCtx, callback, sync).await
    }

    /// Fire-and-forget rebuild-context flush, callable from synchronous
    /// mutation paths.
    pub fn flush_rebuild_context_background(&self, callback: Option<FlushCallback>) {
        let ios = self.select(IoType::RebuildCtx);
        for io in &ios {
            io.begin_io();
        }
        self.dispatch(ios, callback);
    }

    pub async fn wait_pending_io(&self, io_type: IoType) {
        for io in self.select(io_type) {
            io.wait_pending().await;
        }
    }

    pub fn get_stored_context_version(&self, owner: ContextOwner) -> u64 {
        self.owner_io(owner).client.stored_version()
    }

    pub fn reset_dirty_version(&self, owner: ContextOwner) {
        self.owner_io(owner).client.reset_dirty_version();
    }

    fn runtime_handle(&self) -> Handle {
        self.runtime
            .lock()
            .unwrap()
            .clone()
            .expect("ContextIoManager used before init")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator_ctx::AllocatorCtx;
    use crate::base_types::*;
    use crate::event_scheduler::InlineScheduler;
    use crate::meta_io::MemMetaIo;
    use crate::rebuild_ctx::RebuildCtx;
    use crate::segment_ctx::SegmentCtx;
    use more_asserts::*;
    use std::sync::atomic::AtomicU32;

    fn geometry() -> Geometry {
        Geometry {
            stripes_per_segment: 8,
            blocks_per_stripe: 4,
            num_user_segments: 4,
        }
    }

    struct Harness {
        segment: Arc<SegmentCtx>,
        rebuild: Arc<RebuildCtx>,
        meta_io: Arc<MemMetaIo>,
        manager: ContextIoManager,
    }

    fn harness() -> Harness {
        let segment = Arc::new(SegmentCtx::new(geometry()));
        let allocator = Arc::new(AllocatorCtx::new(geometry()));
        let rebuild = Arc::new(RebuildCtx::new(geometry()));
        let meta_io = Arc::new(MemMetaIo::new());
        let manager = ContextIoManager::new(
            segment.clone(),
            allocator.clone(),
            rebuild.clone(),
            meta_io.clone(),
            Arc::new(InlineScheduler),
        );
        Harness {
            segment,
            rebuild,
            meta_io,
            manager,
        }
    }

    #[tokio::test]
    async fn test_init_creates_missing_files() {
        let h = harness();
        h.manager.init().await.unwrap();
        assert!(h.meta_io.file_len("SegmentContext").is_some());
        assert!(h.meta_io.file_len("AllocatorContext").is_some());
        assert!(h.meta_io.file_len("RebuildContext").is_some());
        assert_eq!(
            h.manager.get_stored_context_version(ContextOwner::SegmentCtx),
            0
        );
    }

    #[tokio::test]
    async fn test_stored_version_monotonic() {
        let h = harness();
        h.manager.init().await.unwrap();
        let mut last = h
            .manager
            .get_stored_context_version(ContextOwner::RebuildCtx);
        for i in 0..5 {
            h.rebuild.add_rebuild_target_segment(SegmentId(i));
            h.manager.flush_contexts(None, true).await.unwrap();
            let stored = h
                .manager
                .get_stored_context_version(ContextOwner::RebuildCtx);
            assert_gt!(stored, last);
            assert_le!(stored, h.rebuild.dirty_version());
            last = stored;
        }
    }

    #[tokio::test]
    async fn test_flush_failure_leaves_owner_dirty_and_retries() {
        let h = harness();
        h.manager.init().await.unwrap();
        h.segment.allocate_free_segment().unwrap();

        h.meta_io.set_fail_writes(true);
        let result = h.manager.flush_contexts(None, true).await;
        assert!(matches!(result, Err(AllocError::FlushIoFailed(_))));
        assert_eq!(
            h.manager.get_stored_context_version(ContextOwner::SegmentCtx),
            0
        );

        h.meta_io.set_fail_writes(false);
        h.manager.flush_contexts(None, true).await.unwrap();
        assert_gt!(
            h.manager.get_stored_context_version(ContextOwner::SegmentCtx),
            0
        );
    }

    #[tokio::test]
    async fn test_async_flush_delivers_callback() {
        let h = harness();
        h.manager.init().await.unwrap();
        let delivered = Arc::new(AtomicU32::new(0));
        let seen = delivered.clone();
        h.manager
            .flush_contexts(
                Some(Box::new(move |result| {
                    result.unwrap();
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
                false,
            )
            .await
            .unwrap();
        h.manager.wait_pending_io(IoType::All).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reload_after_flush() {
        let h = harness();
        h.manager.init().await.unwrap();
        let segment = h.segment.allocate_free_segment().unwrap();
        h.rebuild.add_rebuild_target_segment(SegmentId(2));
        h.manager.flush_contexts(None, true).await.unwrap();

        // A second core instance over the same MetaIo sees the state.
        let segment2 = Arc::new(SegmentCtx::new(geometry()));
        let allocator2 = Arc::new(AllocatorCtx::new(geometry()));
        let rebuild2 = Arc::new(RebuildCtx::new(geometry()));
        let manager2 = ContextIoManager::new(
            segment2.clone(),
            allocator2,
            rebuild2.clone(),
            h.meta_io.clone(),
            Arc::new(InlineScheduler),
        );
        manager2.init().await.unwrap();
        assert_eq!(segment2.num_free_segments(), 3);
        assert_eq!(
            segment2.get_segment_state(segment),
            crate::segment_info::SegmentState::Nvram
        );
        assert!(rebuild2.is_rebuild_target_segment(SegmentId(2)));
        assert!(rebuild2.need_rebuild_again());
    }

    /// MetaIo whose writes park on a semaphore, so tests can hold a write
    /// in flight and release it on cue.
    struct GatedMetaIo {
        inner: MemMetaIo,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl crate::meta_io::MetaIo for GatedMetaIo {
        async fn write(&self, filename: &str, buf: &[u8]) -> anyhow::Result<()> {
            self.gate.acquire().await.unwrap().forget();
            self.inner.write(filename, buf).await
        }

        async fn read(&self, filename: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.read(filename).await
        }

        async fn wait_outstanding(&self) {}
    }

    fn gated_rebuild_io() -> (Arc<RebuildCtx>, Arc<GatedMetaIo>, Arc<ContextFileIo>) {
        let rebuild = Arc::new(RebuildCtx::new(geometry()));
        let gated = Arc::new(GatedMetaIo {
            inner: MemMetaIo::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let io = Arc::new(ContextFileIo::new(rebuild.clone(), gated.clone()));
        (rebuild, gated, io)
    }

    #[tokio::test]
    async fn test_concurrent_flush_waits_for_inflight_write() {
        let (rebuild, gated, io) = gated_rebuild_io();

        let first = {
            let io = io.clone();
            tokio::spawn(async move { io.flush_coalesced().await })
        };
        tokio::task::yield_now().await;
        let second = {
            let io = io.clone();
            tokio::spawn(async move { io.flush_coalesced().await })
        };
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // The first caller owns the (gated) write; the second must block
        // until a pass covering its request completes, not return early.
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        gated.gate.add_permits(2);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        // The second request arrived after the first snapshot, so it ran its
        // own pass: versions 0 and 1 were written.
        assert_eq!(rebuild.stored_version(), 1);
        assert_eq!(rebuild.dirty_version(), 2);
    }

    #[tokio::test]
    async fn test_coalesced_flush_sees_write_failure() {
        let (rebuild, gated, io) = gated_rebuild_io();
        gated.inner.set_fail_writes(true);

        let first = {
            let io = io.clone();
            tokio::spawn(async move { io.flush_coalesced().await })
        };
        tokio::task::yield_now().await;
        let second = {
            let io = io.clone();
            tokio::spawn(async move { io.flush_coalesced().await })
        };
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        gated.gate.add_permits(2);
        // Neither caller may see a false success: both observe the failure
        // of a pass covering their request.
        assert!(matches!(
            first.await.unwrap(),
            Err(AllocError::FlushIoFailed(_))
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(AllocError::FlushIoFailed(_))
        ));
        assert_eq!(rebuild.stored_version(), 0);

        // With the fault cleared, the retry succeeds end to end.
        gated.inner.set_fail_writes(false);
        gated.gate.add_permits(1);
        io.begin_io();
        let result = io.flush_coalesced().await;
        io.end_io();
        result.unwrap();
        assert_eq!(rebuild.stored_version(), 2);
    }
}
