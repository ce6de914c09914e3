//! Page-granular I/O buffers
//!
//! An [`IoBuffer`] is an ordered run of page slots. A slot can carry a bare
//! physical page or reference a cache entry, in which case the buffer holds
//! a reference on the entry until [`IoBuffer::reset`] releases it. The
//! flush engine uses one as its coalesce buffer; read paths use them to
//! hand freshly read pages to [`copy_and_cache`](crate::PageCache::copy_and_cache).

use crate::cache::PageCache;
use crate::entry::CacheEntry;
use pageio_common::{PhysAddr, VirtAddr};
use std::sync::Arc;

struct PageSlot {
    physical: PhysAddr,
    virtual_addr: Option<VirtAddr>,
    entry: Option<Arc<CacheEntry>>,
}

/// A buffer of whole pages, some possibly backed by cache entries.
pub struct IoBuffer {
    page_size: u64,
    slots: Vec<PageSlot>,
}

impl IoBuffer {
    /// Create an empty buffer for the given page size.
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            slots: Vec::new(),
        }
    }

    /// Create an empty buffer with room for `capacity_bytes` reserved.
    pub fn with_capacity(page_size: u64, capacity_bytes: u64) -> Self {
        Self {
            page_size,
            slots: Vec::with_capacity((capacity_bytes / page_size) as usize),
        }
    }

    /// Page size this buffer was built for
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of pages in the buffer
    pub fn page_count(&self) -> usize {
        self.slots.len()
    }

    /// Total size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.slots.len() as u64 * self.page_size
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append a cache-backed page. The buffer takes a reference on the
    /// entry; release it with [`reset`](Self::reset).
    pub fn append_entry(&mut self, entry: &Arc<CacheEntry>) {
        entry.add_reference();
        self.slots.push(PageSlot {
            physical: entry.physical(),
            virtual_addr: entry.virtual_address(),
            entry: Some(Arc::clone(entry)),
        });
    }

    /// Append a bare physical page.
    pub fn append_raw(&mut self, physical: PhysAddr, virtual_addr: Option<VirtAddr>) {
        self.slots.push(PageSlot {
            physical,
            virtual_addr,
            entry: None,
        });
    }

    fn slot_index(&self, offset: u64) -> Option<usize> {
        let index = (offset / self.page_size) as usize;
        (index < self.slots.len()).then_some(index)
    }

    /// The cache entry backing the page at byte `offset`, if any.
    pub fn page_cache_entry(&self, offset: u64) -> Option<&Arc<CacheEntry>> {
        self.slot_index(offset)
            .and_then(|index| self.slots[index].entry.as_ref())
    }

    /// Back-reference the page at byte `offset` with a cache entry so the
    /// buffer no longer considers the physical page its own. Takes a
    /// reference on the entry.
    pub fn set_page_cache_entry(&mut self, offset: u64, entry: &Arc<CacheEntry>) {
        let Some(index) = self.slot_index(offset) else {
            return;
        };
        let slot = &mut self.slots[index];
        debug_assert!(slot.entry.is_none());
        debug_assert_eq!(slot.physical, entry.physical());
        entry.add_reference();
        slot.entry = Some(Arc::clone(entry));
    }

    /// Physical address of the page at byte `offset`.
    pub fn page_physical(&self, offset: u64) -> Option<PhysAddr> {
        self.slot_index(offset).map(|index| self.slots[index].physical)
    }

    /// Virtual address of the page at byte `offset`, if mapped.
    pub fn page_virtual(&self, offset: u64) -> Option<VirtAddr> {
        self.slot_index(offset)
            .and_then(|index| self.slots[index].virtual_addr)
    }

    /// Walk the cache entries backing this buffer, in page order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = &Arc<CacheEntry>> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    /// Drop all pages, releasing the references held on cache entries.
    /// Buffers holding cache-backed pages must be reset before being
    /// dropped or the entry references leak.
    pub fn reset(&mut self, cache: &PageCache) {
        for slot in self.slots.drain(..) {
            if let Some(entry) = slot.entry {
                cache.release(&entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[test]
    fn test_raw_pages() {
        let mut buffer = IoBuffer::new(4096);
        buffer.append_raw(PhysAddr::new(0x1000), None);
        buffer.append_raw(PhysAddr::new(0x5000), Some(VirtAddr::new(0x9000)));

        assert_eq!(buffer.page_count(), 2);
        assert_eq!(buffer.size_bytes(), 8192);
        assert_eq!(buffer.page_physical(0), Some(PhysAddr::new(0x1000)));
        assert_eq!(buffer.page_physical(4096), Some(PhysAddr::new(0x5000)));
        assert_eq!(buffer.page_virtual(4096), Some(VirtAddr::new(0x9000)));
        assert!(buffer.page_cache_entry(0).is_none());
        assert!(buffer.page_physical(8192).is_none());
    }

    #[test]
    fn test_entry_pages_hold_references() {
        let harness = Harness::new();
        let file = harness.file(0x4000);
        let entry = harness.insert_page(&file, 0, 0xaa);
        assert_eq!(entry.references(), 1);

        let mut buffer = IoBuffer::new(4096);
        buffer.append_entry(&entry);
        assert_eq!(entry.references(), 2);
        assert!(Arc::ptr_eq(buffer.page_cache_entry(0).unwrap(), &entry));

        buffer.reset(&harness.cache);
        assert_eq!(entry.references(), 1);
        assert!(buffer.is_empty());
        harness.cache.release(&entry);
    }

    #[test]
    fn test_set_page_cache_entry() {
        let harness = Harness::new();
        let file = harness.file(0x4000);
        let entry = harness.insert_page(&file, 0, 0xbb);

        let mut buffer = IoBuffer::new(4096);
        buffer.append_raw(entry.physical(), None);
        buffer.set_page_cache_entry(0, &entry);
        assert_eq!(entry.references(), 2);
        assert!(buffer.page_cache_entry(0).is_some());

        buffer.reset(&harness.cache);
        harness.cache.release(&entry);
    }
}
