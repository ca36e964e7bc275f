use log::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Admission flag for *user* block allocations.  System allocations (GC,
/// rebuild, metadata) are never gated here.  Prohibited while GC is urgent;
/// re-permitted once a freed segment brings the mode back down.
pub struct BlockAllocationStatus {
    user_allocation_prohibited: AtomicBool,
}

impl Default for BlockAllocationStatus {
    fn default() -> BlockAllocationStatus {
        BlockAllocationStatus {
            user_allocation_prohibited: AtomicBool::new(false),
        }
    }
}

impl BlockAllocationStatus {
    pub fn is_user_block_allocation_permitted(&self) -> bool {
        !self.user_allocation_prohibited.load(Ordering::SeqCst)
    }

    pub fn permit_user_block_allocation(&self) {
        if self.user_allocation_prohibited.swap(false, Ordering::SeqCst) {
            info!("user block allocation permitted");
        }
    }

    pub fn prohibit_user_block_allocation(&self) {
        if !self.user_allocation_prohibited.swap(true, Ordering::SeqCst) {
            info!("user block allocation prohibited");
        }
    }

    /// Claim the prohibition; returns false if it was already prohibited.
    /// Lets a GC worker know whether it is the one that flipped the flag.
    pub fn try_prohibit_user_block_allocation(&self) -> bool {
        self.user_allocation_prohibited
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permit_prohibit() {
        let status = BlockAllocationStatus::default();
        assert!(status.is_user_block_allocation_permitted());
        status.prohibit_user_block_allocation();
        assert!(!status.is_user_block_allocation_permitted());
        status.permit_user_block_allocation();
        assert!(status.is_user_block_allocation_permitted());
    }

    #[test]
    fn test_try_prohibit_claims_once() {
        let status = BlockAllocationStatus::default();
        assert!(status.try_prohibit_user_block_allocation());
        assert!(!status.try_prohibit_user_block_allocation());
    }
}
