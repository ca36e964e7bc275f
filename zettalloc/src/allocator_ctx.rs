use crate::base_types::*;
use crate::context_io::ContextIoClient;
use crate::error::{AllocError, AllocResult};
use lazy_static::lazy_static;
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use util::get_tunable;

lazy_static! {
    // One open-stripe tail slot per volume.
    static ref ACTIVE_STRIPE_TAIL_SLOTS: usize = get_tunable("active_stripe_tail_slots", 256);
}

pub const SIG_ALLOCATOR_CTX: u32 = 0xBFBF_BFBF;
pub const ALLOCATOR_CTX_FILENAME: &str = "AllocatorContext";

const SECTION_HEADER: usize = 0;
const SECTION_NEXT_SSD_LSID: usize = 1;
const SECTION_ACTIVE_STRIPE_TAIL: usize = 2;
const NUM_SECTIONS: usize = 3;

// Fixed-int encoded sizes of the non-header records.
const LSID_SIZE: usize = 4;
const VBA_SIZE: usize = 8;

#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
struct AllocatorCtxHeaderPhys {
    sig: u32,
    version: u64,
    num_sections: u32,
}
impl OnDisk for AllocatorCtxHeaderPhys {}

/// Durable write cursor: the next SSD stripe to hand to the write path, plus
/// the per-slot open-stripe tails.  All mutation goes through the internal
/// mutex; flush snapshots under the same mutex.
pub struct AllocatorCtx {
    state: Mutex<AllocatorState>,
    dirty_version: AtomicU64,
    stored_version: AtomicU64,
    geometry: Geometry,
}

struct AllocatorState {
    next_ssd_lsid: StripeId,
    active_stripe_tail: Vec<VirtualBlockAddr>,
}

impl AllocatorCtx {
    pub fn new(geometry: Geometry) -> AllocatorCtx {
        AllocatorCtx {
            state: Mutex::new(AllocatorState {
                next_ssd_lsid: StripeId::UNMAP,
                active_stripe_tail: vec![VirtualBlockAddr::UNMAP; *ACTIVE_STRIPE_TAIL_SLOTS],
            }),
            dirty_version: AtomicU64::new(0),
            stored_version: AtomicU64::new(0),
            geometry,
        }
    }

    /// Snap the write cursor to the first stripe of `segment`.
    pub fn set_next_ssd_lsid(&self, segment: SegmentId) {
        let lsid = self.geometry.first_stripe_of(segment);
        let mut state = self.state.lock().unwrap();
        trace!(
            "next ssd lsid {:?} -> {:?} (segment {})",
            state.next_ssd_lsid,
            lsid,
            segment
        );
        state.next_ssd_lsid = lsid;
    }

    /// Restore the cursor to an arbitrary stripe; journal replay only.
    pub fn set_next_ssd_lsid_raw(&self, lsid: StripeId) {
        self.state.lock().unwrap().next_ssd_lsid = lsid;
    }

    pub fn next_ssd_lsid(&self) -> StripeId {
        self.state.lock().unwrap().next_ssd_lsid
    }

    pub fn num_active_stripe_tail_slots(&self) -> usize {
        self.state.lock().unwrap().active_stripe_tail.len()
    }

    pub fn active_stripe_tail(&self, slot: usize) -> VirtualBlockAddr {
        self.state.lock().unwrap().active_stripe_tail[slot]
    }

    pub fn set_active_stripe_tail(&self, slot: usize, tail: VirtualBlockAddr) {
        self.state.lock().unwrap().active_stripe_tail[slot] = tail;
    }

    pub fn reset_active_stripe_tail(&self, slot: usize) {
        self.set_active_stripe_tail(slot, VirtualBlockAddr::UNMAP);
    }
}

impl ContextIoClient for AllocatorCtx {
    fn signature(&self) -> u32 {
        SIG_ALLOCATOR_CTX
    }

    fn filename(&self) -> &'static str {
        ALLOCATOR_CTX_FILENAME
    }

    fn num_sections(&self) -> usize {
        NUM_SECTIONS
    }

    fn section_size(&self, section: usize) -> usize {
        match section {
            SECTION_HEADER => CTX_HEADER_SIZE,
            SECTION_NEXT_SSD_LSID => LSID_SIZE,
            SECTION_ACTIVE_STRIPE_TAIL => VBA_SIZE * self.num_active_stripe_tail_slots(),
            _ => panic!("invalid allocator context section {}", section),
        }
    }

    fn before_flush(&self, buf: &mut Vec<u8>) {
        let state = self.state.lock().unwrap();
        let version = self.dirty_version.fetch_add(1, Ordering::SeqCst);
        ondisk_encode_into(
            buf,
            &AllocatorCtxHeaderPhys {
                sig: SIG_ALLOCATOR_CTX,
                version,
                num_sections: NUM_SECTIONS as u32,
            },
        );
        ondisk_encode_into(buf, &state.next_ssd_lsid);
        for tail in &state.active_stripe_tail {
            ondisk_encode_into(buf, tail);
        }
        trace!(
            "ready to flush allocator context version {} (next ssd lsid {:?})",
            version,
            state.next_ssd_lsid
        );
    }

    fn after_load(&self, buf: &[u8]) -> AllocResult<()> {
        let header: AllocatorCtxHeaderPhys = ondisk_decode(buf)
            .map_err(|e| AllocError::LoadCorrupt(format!("allocator context header: {}", e)))?;
        if header.sig != SIG_ALLOCATOR_CTX {
            return Err(AllocError::LoadCorrupt(format!(
                "allocator context signature mismatch: {:#x}",
                header.sig
            )));
        }

        let mut state = self.state.lock().unwrap();
        let expected = CTX_HEADER_SIZE + LSID_SIZE + VBA_SIZE * state.active_stripe_tail.len();
        if buf.len() != expected {
            return Err(AllocError::LoadCorrupt(format!(
                "allocator context is {} bytes, expected {}",
                buf.len(),
                expected
            )));
        }

        let mut offset = CTX_HEADER_SIZE;
        state.next_ssd_lsid = ondisk_decode(&buf[offset..])
            .map_err(|e| AllocError::LoadCorrupt(format!("next ssd lsid: {}", e)))?;
        offset += LSID_SIZE;
        for slot in 0..state.active_stripe_tail.len() {
            state.active_stripe_tail[slot] = ondisk_decode(&buf[offset..])
                .map_err(|e| AllocError::LoadCorrupt(format!("stripe tail {}: {}", slot, e)))?;
            offset += VBA_SIZE;
        }

        self.stored_version.store(header.version, Ordering::SeqCst);
        self.dirty_version.store(header.version + 1, Ordering::SeqCst);
        debug!(
            "allocator context loaded: version {}, next ssd lsid {:?}",
            header.version, state.next_ssd_lsid
        );
        Ok(())
    }

    fn finalize_io(&self, buf: &[u8]) {
        // The header at the front of the just-written buffer carries the
        // version this write made durable.
        let header: AllocatorCtxHeaderPhys = ondisk_decode(buf).unwrap();
        self.stored_version.store(header.version, Ordering::SeqCst);
        debug!("allocator context stored, version {}", header.version);
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
            num_user_segments: 4,
        }
    }

    #[test]
    fn test_set_next_ssd_lsid_snaps_to_first_stripe() {
        let ctx = AllocatorCtx::new(geometry());
        assert_eq!(ctx.next_ssd_lsid(), StripeId::UNMAP);
        ctx.set_next_ssd_lsid(SegmentId(2));
        assert_eq!(ctx.next_ssd_lsid(), StripeId(16));
    }

    #[test]
    fn test_flush_load_roundtrip() {
        let ctx = AllocatorCtx::new(geometry());
        ctx.set_next_ssd_lsid(SegmentId(3));
        ctx.set_active_stripe_tail(
            5,
            VirtualBlockAddr {
                stripe_id: StripeId(41),
                offset: 2,
            },
        );

        let mut buf = Vec::with_capacity(ctx.total_size());
        ctx.before_flush(&mut buf);
        assert_eq!(buf.len(), ctx.total_size());

        let restored = AllocatorCtx::new(geometry());
        restored.after_load(&buf).unwrap();
        assert_eq!(restored.next_ssd_lsid(), StripeId(24));
        assert_eq!(restored.active_stripe_tail(5).stripe_id, StripeId(41));
        assert_eq!(restored.active_stripe_tail(0), VirtualBlockAddr::UNMAP);
        assert_eq!(restored.stored_version(), 0);
        assert_eq!(restored.dirty_version(), 1);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let ctx = AllocatorCtx::new(geometry());
        let mut buf = Vec::new();
        ctx.before_flush(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(
            AllocatorCtx::new(geometry()).after_load(&buf),
            Err(AllocError::LoadCorrupt(_))
        ));
    }

    #[test]
    fn test_version_advances_per_flush() {
        let ctx = AllocatorCtx::new(geometry());
        for expected in 0..3 {
            let mut buf = Vec::new();
            ctx.before_flush(&mut buf);
            ctx.finalize_io(&buf);
            assert_eq!(ctx.stored_version(), expected);
            assert_eq!(ctx.dirty_version(), expected + 1);
        }
    }
}
