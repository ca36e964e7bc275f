use thiserror::Error;

/// Error kinds surfaced to callers of the allocator core.  Invariant
/// violations (counter underflow, illegal state transitions, double
/// free/alloc of a bitmap bit) are not represented here: those panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The free-segment bitmap is empty.  Recoverable: the caller waits for
    /// GC to reclaim a segment.
    #[error("no free segment available")]
    NoFreeSegment,

    /// StopRebuilding was called but the rebuild target set is already
    /// empty.  Informational.
    #[error("rebuild target set is already empty")]
    RebuildSetEmpty,

    /// A context write failed in the metadata I/O layer.  The stored version
    /// is left untouched, so the owner remains dirty and the next flush
    /// retries.
    #[error("context flush failed: {0}")]
    FlushIoFailed(String),

    /// A context file failed signature or structural validation on load.
    /// The caller may fall back to the fresh-init path.
    #[error("context load corrupt: {0}")]
    LoadCorrupt(String),
}

pub type AllocResult<T> = Result<T, AllocError>;
