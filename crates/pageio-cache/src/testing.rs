//! Shared fixtures for the crate's tests

use crate::cache::PageCache;
use crate::config::Tunables;
use crate::entry::CacheEntry;
use crate::io::MemoryStore;
use crate::mm::{HeapMemoryManager, MemoryManager};
use crate::object::FileObject;
use pageio_common::{ObjectType, PhysAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const TEST_PAGE_SIZE: u64 = 4096;

/// A cache wired to a heap memory manager and an in-memory backing store.
pub(crate) struct Harness {
    pub mm: Arc<HeapMemoryManager>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<PageCache>,
}

impl Harness {
    /// 1024 physical pages, small virtual space, default tunables.
    pub fn new() -> Self {
        Self::build(1024, Tunables::default())
    }

    /// 64 physical pages: trigger 6, retreat 9, minimum 4, clean
    /// minimum 6. Handy for pressure tests.
    pub fn small() -> Self {
        Self::build(64, Tunables::default())
    }

    pub fn with_tunables(tunables: Tunables) -> Self {
        Self::build(1024, tunables)
    }

    pub fn small_with_tunables(tunables: Tunables) -> Self {
        Self::build(64, tunables)
    }

    fn build(total_pages: u64, tunables: Tunables) -> Self {
        let mm = Arc::new(HeapMemoryManager::new(
            TEST_PAGE_SIZE,
            total_pages,
            2 * 1024 * 1024 * 1024,
        ));
        let store = Arc::new(MemoryStore::new(
            Arc::clone(&mm) as Arc<dyn MemoryManager>
        ));
        let cache = PageCache::new(
            Arc::clone(&mm) as Arc<dyn MemoryManager>,
            Arc::clone(&store) as Arc<dyn crate::io::NonCachedIo>,
            tunables,
        );
        Self { mm, store, cache }
    }

    pub fn file(&self, size: u64) -> Arc<FileObject> {
        FileObject::new(ObjectType::RegularFile, size)
    }

    pub fn device(&self, size: u64) -> Arc<FileObject> {
        FileObject::new(ObjectType::BlockDevice, size)
    }

    /// Allocate a physical page filled with `fill`.
    pub fn page_with(&self, fill: u8) -> PhysAddr {
        let page = self.mm.allocate_page().expect("out of test pages");
        self.mm
            .write_page(page, 0, &vec![fill; TEST_PAGE_SIZE as usize]);
        page
    }

    /// Install a clean page at (object, offset). The returned entry
    /// carries a reference.
    pub fn insert_page(&self, object: &Arc<FileObject>, offset: u64, fill: u8) -> Arc<CacheEntry> {
        let page = self.page_with(fill);
        self.cache
            .create_and_insert(object, None, page, offset, None)
            .expect("insert failed")
    }

    /// Install a dirty page at (object, offset).
    pub fn insert_dirty_page(
        &self,
        object: &Arc<FileObject>,
        offset: u64,
        fill: u8,
    ) -> Arc<CacheEntry> {
        let entry = self.insert_page(object, offset, fill);
        assert!(self.cache.mark_dirty(&entry));
        entry
    }

    /// Read the page frame behind an entry.
    pub fn page_bytes(&self, entry: &Arc<CacheEntry>) -> Vec<u8> {
        let mut buf = vec![0u8; TEST_PAGE_SIZE as usize];
        self.mm.read_page(entry.physical(), &mut buf);
        buf
    }

    /// Poll for a condition, for tests that wait on the worker.
    pub fn wait_until(&self, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }

            std::thread::sleep(Duration::from_millis(5));
        }

        condition()
    }
}
