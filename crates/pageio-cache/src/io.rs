//! Non-cached I/O boundary
//!
//! Coalesced flush buffers leave the cache through the [`NonCachedIo`]
//! trait. The [`MemoryStore`] reference implementation keeps the backing
//! store in memory and records every submission, which is what the flush
//! and round-trip tests assert against.

use crate::io_buffer::IoBuffer;
use crate::mm::MemoryManager;
use crate::object::FileObject;
use bytes::Bytes;
use pageio_common::{CacheError, ObjectId, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// I/O flags accepted by flush and the write boundary.
pub mod io_flags {
    /// The caller wants the data durably on the device before the call
    /// returns; no separate device synchronize pass is needed.
    pub const DATA_SYNCHRONIZED: u32 = 0x0000_0001;
}

/// One write handed to the non-cached path: a coalesced buffer and the
/// byte count to take from it.
pub struct IoContext<'a> {
    /// Coalesced pages, offset-ascending
    pub buffer: &'a IoBuffer,
    /// Byte offset within the object
    pub offset: u64,
    /// Bytes to write from the front of the buffer
    pub size: u64,
    /// `io_flags` bits
    pub flags: u32,
}

/// The write path below the cache.
pub trait NonCachedIo: Send + Sync {
    /// Write `ctx.size` bytes from the buffer to the object at
    /// `ctx.offset`. Returns the number of bytes completed, which may be
    /// short.
    fn perform_non_cached_write(&self, object: &FileObject, ctx: &IoContext<'_>) -> Result<u64>;

    /// Flush the device's own caches. Issued after unsynchronized writes
    /// to block devices.
    fn synchronize(&self, object: &FileObject) -> Result<()>;
}

/// A submission observed by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub object: ObjectId,
    pub offset: u64,
    pub size: u64,
}

/// In-memory backing store. Pages are stored per object keyed by
/// page-aligned offset.
pub struct MemoryStore {
    mm: Arc<dyn MemoryManager>,
    contents: Mutex<HashMap<ObjectId, BTreeMap<u64, Bytes>>>,
    writes: Mutex<Vec<WriteRecord>>,
    /// When set, the next write completes at most this many bytes
    short_write_limit: Mutex<Option<u64>>,
    /// When set, the next write fails outright with a device error
    fail_next: Mutex<Option<String>>,
    sync_count: AtomicU64,
}

impl MemoryStore {
    pub fn new(mm: Arc<dyn MemoryManager>) -> Self {
        Self {
            mm,
            contents: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            short_write_limit: Mutex::new(None),
            fail_next: Mutex::new(None),
            sync_count: AtomicU64::new(0),
        }
    }

    /// Read back stored bytes; holes read as zero.
    pub fn read(&self, object: ObjectId, offset: u64, len: usize) -> Vec<u8> {
        let page_size = self.mm.page_size();
        let contents = self.contents.lock();
        let mut out = vec![0u8; len];
        let Some(pages) = contents.get(&object) else {
            return out;
        };

        for index in 0..len {
            let absolute = offset + index as u64;
            let page_offset = absolute - (absolute % page_size);
            if let Some(page) = pages.get(&page_offset) {
                let within = (absolute - page_offset) as usize;
                if within < page.len() {
                    out[index] = page[within];
                }
            }
        }

        out
    }

    /// Every submission seen so far, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Make the next write complete at most `bytes` bytes.
    pub fn short_write_once(&self, bytes: u64) {
        *self.short_write_limit.lock() = Some(bytes);
    }

    /// Make the next write fail with a device error.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }

    /// Number of device synchronize calls observed.
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::SeqCst)
    }
}

impl NonCachedIo for MemoryStore {
    fn perform_non_cached_write(&self, object: &FileObject, ctx: &IoContext<'_>) -> Result<u64> {
        if let Some(message) = self.fail_next.lock().take() {
            return Err(CacheError::Device(message));
        }

        let completing = match self.short_write_limit.lock().take() {
            Some(limit) => ctx.size.min(limit),
            None => ctx.size,
        };

        self.writes.lock().push(WriteRecord {
            object: object.id(),
            offset: ctx.offset,
            size: ctx.size,
        });

        let page_size = self.mm.page_size();
        let mut contents = self.contents.lock();
        let pages = contents.entry(object.id()).or_default();
        let mut done = 0u64;
        let mut buffer_offset = 0u64;
        while done < completing {
            let take = (completing - done).min(page_size);
            let Some(physical) = ctx.buffer.page_physical(buffer_offset) else {
                break;
            };

            let mut data = vec![0u8; take as usize];
            self.mm.read_page(physical, &mut data);
            pages.insert(ctx.offset + done, Bytes::from(data));
            done += take;
            buffer_offset += page_size;
        }

        Ok(done)
    }

    fn synchronize(&self, _object: &FileObject) -> Result<()> {
        self.sync_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
