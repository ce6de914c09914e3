//! Entry record allocator
//!
//! Entry records come out of a budgeted allocator so that a runaway cache
//! cannot exhaust the rest of the system's record storage. The budget is
//! optional; the accounting (outstanding and peak counts) is always kept.

use crate::entry::CacheEntry;
use crate::object::FileObject;
use pageio_common::{CacheError, PhysAddr, Result, VirtAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Produces and recycles cache entry records.
pub(crate) struct EntryAllocator {
    /// Optional cap on live records
    limit: Option<usize>,
    /// Records currently alive
    outstanding: AtomicUsize,
    /// High-water mark of live records
    peak: AtomicUsize,
}

impl EntryAllocator {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            outstanding: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Allocate and initialize a new entry record. Fails with
    /// `OutOfMemory` when the budget is exhausted.
    pub(crate) fn allocate(
        &self,
        object: Arc<FileObject>,
        virtual_addr: Option<VirtAddr>,
        physical: PhysAddr,
        offset: u64,
    ) -> Result<Arc<CacheEntry>> {
        let count = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.limit {
            if count > limit {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                return Err(CacheError::OutOfMemory);
            }
        }

        self.peak.fetch_max(count, Ordering::SeqCst);
        Ok(Arc::new(CacheEntry::new(
            object,
            virtual_addr,
            physical,
            offset,
        )))
    }

    /// Return a record to the allocator. Called once per allocated record
    /// when it is destroyed or discarded.
    pub(crate) fn recycle(&self) {
        let old = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old != 0);
    }

    /// Records currently alive
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// High-water mark of live records
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}
