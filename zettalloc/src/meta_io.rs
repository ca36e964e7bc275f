use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Metadata file I/O, consumed but not implemented by the core.  The core
/// coordinates at-most-one outstanding write per filename itself; an
/// implementation only has to move bytes.
#[async_trait]
pub trait MetaIo: Send + Sync {
    /// Write the full contents of `filename`, replacing any previous
    /// contents.  Resolves when the write is durable.
    async fn write(&self, filename: &str, buf: &[u8]) -> Result<()>;

    /// Read the full contents of `filename`.  `None` if the file has never
    /// been written.
    async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>>;

    /// Block until every write issued so far is acknowledged.
    async fn wait_outstanding(&self);
}

/// In-memory MetaIo used by tests.  Files survive as long as the instance
/// does, so crash-recovery tests share one `Arc<MemMetaIo>` across core
/// instances.
#[derive(Default)]
pub struct MemMetaIo {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemMetaIo {
    pub fn new() -> MemMetaIo {
        Default::default()
    }

    /// When set, subsequent writes fail without touching the stored file.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn file_len(&self, filename: &str) -> Option<usize> {
        self.files.lock().unwrap().get(filename).map(Vec::len)
    }
}

#[async_trait]
impl MetaIo for MemMetaIo {
    async fn write(&self, filename: &str, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("injected write failure for {}", filename));
        }
        trace!("mem meta io: write {} ({} bytes)", filename, buf.len());
        self.files
            .lock()
            .unwrap()
            .insert(filename.to_owned(), buf.to_owned());
        Ok(())
    }

    async fn read(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.lock().unwrap().get(filename).cloned())
    }

    async fn wait_outstanding(&self) {}
}
