//! Memory manager boundary
//!
//! The cache does not own physical memory, virtual mappings, or image
//! sections; it consumes them through the [`MemoryManager`] trait. The
//! [`HeapMemoryManager`] is the reference implementation: page frames are
//! heap allocations, virtual addresses are handed out from a counter, and
//! memory pressure is simulated, which is what the tests drive.

use crossbeam_channel::{unbounded, Receiver, Sender};
use pageio_common::{CacheError, PhysAddr, Result, VirtAddr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// How much virtual-memory pressure the system reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryWarningLevel {
    /// No pressure
    None,
    /// Free virtual memory is getting low
    Low,
    /// Free virtual memory is critically low
    High,
}

/// Image sections mapping a file-like object. The cache unmaps these
/// before reclaiming a page so user mappings cannot outlive the cached
/// data.
#[derive(Default)]
pub struct ImageSectionList {
    sections: Mutex<Vec<ImageSection>>,
}

#[derive(Debug, Clone)]
struct ImageSection {
    offset: u64,
    size: u64,
    mapped: bool,
    dirty: bool,
    /// Pinned sections cannot be unmapped (a non-paged mapping)
    pinned: bool,
}

impl ImageSectionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a section mapping `[offset, offset + size)` of the object.
    pub fn map_section(&self, offset: u64, size: u64) {
        self.sections.lock().push(ImageSection {
            offset,
            size,
            mapped: true,
            dirty: false,
            pinned: false,
        });
    }

    /// Mark the section containing `offset` as dirtied through the
    /// mapping.
    pub fn mark_section_dirty(&self, offset: u64) {
        let mut sections = self.sections.lock();
        for section in sections.iter_mut() {
            if section.mapped && offset >= section.offset && offset < section.offset + section.size
            {
                section.dirty = true;
            }
        }
    }

    /// Pin the section containing `offset` so it cannot be unmapped.
    pub fn pin_section(&self, offset: u64) {
        let mut sections = self.sections.lock();
        for section in sections.iter_mut() {
            if offset >= section.offset && offset < section.offset + section.size {
                section.pinned = true;
            }
        }
    }

    /// Whether any mapped section intersects `[offset, offset + size)`.
    pub fn is_mapped(&self, offset: u64, size: u64) -> bool {
        self.sections
            .lock()
            .iter()
            .any(|s| s.mapped && s.offset < offset + size && offset < s.offset + s.size)
    }

    /// Unmap every section intersecting `[offset, offset + size)`.
    /// Returns whether any unmapped page had been dirtied through a
    /// mapping. Fails with `ResourceInUse` when a pinned section
    /// intersects the range.
    pub fn unmap_range(&self, offset: u64, size: u64) -> Result<bool> {
        let mut sections = self.sections.lock();
        let intersecting = |s: &ImageSection| s.offset < offset + size && offset < s.offset + s.size;

        if sections.iter().any(|s| s.pinned && intersecting(s)) {
            return Err(CacheError::ResourceInUse);
        }

        let mut was_dirty = false;
        for section in sections.iter_mut() {
            if section.mapped && intersecting(section) {
                was_dirty |= section.dirty;
                section.mapped = false;
                section.dirty = false;
            }
        }

        Ok(was_dirty)
    }
}

/// The memory-manager surface the cache consumes.
pub trait MemoryManager: Send + Sync {
    /// Size of one page in bytes
    fn page_size(&self) -> u64;

    /// Allocate a zeroed physical page; `None` when exhausted
    fn allocate_page(&self) -> Option<PhysAddr>;

    /// Release a physical page
    fn free_page(&self, page: PhysAddr);

    /// Map a physical page into the kernel virtual space
    fn map_page(&self, page: PhysAddr) -> Option<VirtAddr>;

    /// Unmap a contiguous virtual range
    fn unmap_range(&self, start: VirtAddr, size: u64);

    /// Read the contents of a page into `buf` (at most one page)
    fn read_page(&self, page: PhysAddr, buf: &mut [u8]);

    /// Write `data` into a page starting at `offset` bytes in
    fn write_page(&self, page: PhysAddr, offset: usize, data: &[u8]);

    /// Total physical pages in the system
    fn total_physical_pages(&self) -> u64;

    /// Physical pages currently free
    fn free_physical_pages(&self) -> u64;

    /// Total kernel virtual space in bytes
    fn total_virtual_bytes(&self) -> u64;

    /// Kernel virtual space currently free, in bytes
    fn free_virtual_bytes(&self) -> u64;

    /// Current virtual-memory warning level
    fn virtual_warning_level(&self) -> MemoryWarningLevel;

    /// Ask the pager to push user pages out until the free-page count
    /// reaches `free_page_target`
    fn request_pageout(&self, free_page_target: u64);

    /// Signaled when free physical memory runs low
    fn physical_warning(&self) -> Receiver<()>;

    /// Signaled when free virtual memory runs low
    fn virtual_warning(&self) -> Receiver<()>;

    /// Unmap image sections covering `[offset, offset + size)` of the
    /// object the list belongs to, reporting whether a mapping had
    /// dirtied the range
    fn unmap_image_sections(
        &self,
        sections: &ImageSectionList,
        offset: u64,
        size: u64,
    ) -> Result<bool> {
        sections.unmap_range(offset, size)
    }
}

/// Reference memory manager backed by heap allocations.
pub struct HeapMemoryManager {
    page_size: u64,
    total_pages: u64,
    total_virtual_bytes: u64,
    frames: Mutex<HashMap<u64, Box<[u8]>>>,
    mappings: Mutex<HashMap<u64, u64>>,
    next_physical: AtomicU64,
    next_virtual: AtomicU64,
    /// Pages considered in use by the rest of the system; raising this
    /// simulates an allocating process
    external_pages: AtomicU64,
    warning_level: Mutex<MemoryWarningLevel>,
    pageout_requests: Mutex<Vec<u64>>,
    physical_warning: (Sender<()>, Receiver<()>),
    virtual_warning: (Sender<()>, Receiver<()>),
}

impl HeapMemoryManager {
    /// Create a manager with the given geometry.
    pub fn new(page_size: u64, total_pages: u64, total_virtual_bytes: u64) -> Self {
        Self {
            page_size,
            total_pages,
            total_virtual_bytes,
            frames: Mutex::new(HashMap::new()),
            mappings: Mutex::new(HashMap::new()),
            next_physical: AtomicU64::new(page_size),
            next_virtual: AtomicU64::new(0x1000_0000),
            external_pages: AtomicU64::new(0),
            warning_level: Mutex::new(MemoryWarningLevel::None),
            pageout_requests: Mutex::new(Vec::new()),
            physical_warning: unbounded(),
            virtual_warning: unbounded(),
        }
    }

    /// Simulate an allocating process holding `pages` physical pages.
    pub fn set_external_pages(&self, pages: u64) {
        self.external_pages.store(pages, Ordering::SeqCst);
    }

    /// Force the reported virtual warning level.
    pub fn set_virtual_warning_level(&self, level: MemoryWarningLevel) {
        *self.warning_level.lock() = level;
    }

    /// Fire the physical-memory warning event.
    pub fn raise_physical_warning(&self) {
        let _ = self.physical_warning.0.send(());
    }

    /// Fire the virtual-memory warning event.
    pub fn raise_virtual_warning(&self) {
        let _ = self.virtual_warning.0.send(());
    }

    /// Free-page targets passed to `request_pageout`, oldest first.
    pub fn pageout_requests(&self) -> Vec<u64> {
        self.pageout_requests.lock().clone()
    }

    /// Number of pages currently allocated from this manager.
    pub fn allocated_pages(&self) -> u64 {
        self.frames.lock().len() as u64
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> u64 {
        self.mappings.lock().len() as u64
    }
}

impl MemoryManager for HeapMemoryManager {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn allocate_page(&self) -> Option<PhysAddr> {
        let mut frames = self.frames.lock();
        if frames.len() as u64 + self.external_pages.load(Ordering::SeqCst) >= self.total_pages {
            return None;
        }

        let raw = self
            .next_physical
            .fetch_add(self.page_size, Ordering::SeqCst);
        frames.insert(raw, vec![0u8; self.page_size as usize].into_boxed_slice());
        Some(PhysAddr::new(raw))
    }

    fn free_page(&self, page: PhysAddr) {
        let removed = self.frames.lock().remove(&page.raw());
        debug_assert!(removed.is_some(), "freeing unallocated page {page:?}");
    }

    fn map_page(&self, page: PhysAddr) -> Option<VirtAddr> {
        let mut mappings = self.mappings.lock();
        if (mappings.len() as u64 + 1) * self.page_size > self.total_virtual_bytes {
            return None;
        }

        let raw = self
            .next_virtual
            .fetch_add(self.page_size, Ordering::SeqCst);
        mappings.insert(raw, page.raw());
        Some(VirtAddr::new(raw))
    }

    fn unmap_range(&self, start: VirtAddr, size: u64) {
        let mut mappings = self.mappings.lock();
        let mut addr = start.raw();
        let end = start.raw() + size;
        while addr < end {
            mappings.remove(&addr);
            addr += self.page_size;
        }
    }

    fn read_page(&self, page: PhysAddr, buf: &mut [u8]) {
        let frames = self.frames.lock();
        if let Some(frame) = frames.get(&page.raw()) {
            let len = buf.len().min(frame.len());
            buf[..len].copy_from_slice(&frame[..len]);
        }
    }

    fn write_page(&self, page: PhysAddr, offset: usize, data: &[u8]) {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get_mut(&page.raw()) {
            let end = (offset + data.len()).min(frame.len());
            if end > offset {
                frame[offset..end].copy_from_slice(&data[..end - offset]);
            }
        }
    }

    fn total_physical_pages(&self) -> u64 {
        self.total_pages
    }

    fn free_physical_pages(&self) -> u64 {
        let used = self.allocated_pages() + self.external_pages.load(Ordering::SeqCst);
        self.total_pages.saturating_sub(used)
    }

    fn total_virtual_bytes(&self) -> u64 {
        self.total_virtual_bytes
    }

    fn free_virtual_bytes(&self) -> u64 {
        self.total_virtual_bytes
            .saturating_sub(self.mapped_pages() * self.page_size)
    }

    fn virtual_warning_level(&self) -> MemoryWarningLevel {
        *self.warning_level.lock()
    }

    fn request_pageout(&self, free_page_target: u64) {
        self.pageout_requests.lock().push(free_page_target);
    }

    fn physical_warning(&self) -> Receiver<()> {
        self.physical_warning.1.clone()
    }

    fn virtual_warning(&self) -> Receiver<()> {
        self.virtual_warning.1.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> HeapMemoryManager {
        HeapMemoryManager::new(4096, 64, 1024 * 1024)
    }

    #[test]
    fn test_allocate_free_cycle() {
        let mm = manager();
        let page = mm.allocate_page().unwrap();
        assert!(page.is_aligned(4096));
        assert_eq!(mm.free_physical_pages(), 63);
        mm.free_page(page);
        assert_eq!(mm.free_physical_pages(), 64);
    }

    #[test]
    fn test_page_contents() {
        let mm = manager();
        let page = mm.allocate_page().unwrap();
        mm.write_page(page, 8, b"pagecache");
        let mut buf = vec![0u8; 4096];
        mm.read_page(page, &mut buf);
        assert_eq!(&buf[8..17], b"pagecache");
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_exhaustion() {
        let mm = HeapMemoryManager::new(4096, 2, 1024 * 1024);
        let _a = mm.allocate_page().unwrap();
        let _b = mm.allocate_page().unwrap();
        assert!(mm.allocate_page().is_none());
    }

    #[test]
    fn test_external_pressure() {
        let mm = manager();
        mm.set_external_pages(60);
        assert_eq!(mm.free_physical_pages(), 4);
        let _pages: Vec<_> = (0..4).map(|_| mm.allocate_page().unwrap()).collect();
        assert!(mm.allocate_page().is_none());
    }

    #[test]
    fn test_map_unmap_contiguous() {
        let mm = manager();
        let a = mm.allocate_page().unwrap();
        let b = mm.allocate_page().unwrap();
        let va_a = mm.map_page(a).unwrap();
        let va_b = mm.map_page(b).unwrap();
        // Consecutive mappings are virtually contiguous.
        assert_eq!(va_b, va_a.offset(4096));
        assert_eq!(mm.mapped_pages(), 2);
        mm.unmap_range(va_a, 2 * 4096);
        assert_eq!(mm.mapped_pages(), 0);
    }

    #[test]
    fn test_warning_events() {
        let mm = manager();
        let rx = mm.physical_warning();
        mm.raise_physical_warning();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_image_sections_unmap() {
        let sections = ImageSectionList::new();
        sections.map_section(0, 0x4000);
        sections.mark_section_dirty(0x1000);
        assert!(sections.is_mapped(0x1000, 0x1000));

        let was_dirty = sections.unmap_range(0x1000, 0x1000).unwrap();
        assert!(was_dirty);
        assert!(!sections.is_mapped(0, 0x4000));

        // A second unmap sees nothing dirty.
        sections.map_section(0, 0x4000);
        assert!(!sections.unmap_range(0, 0x4000).unwrap());
    }

    #[test]
    fn test_pinned_section_refuses_unmap() {
        let sections = ImageSectionList::new();
        sections.map_section(0, 0x2000);
        sections.pin_section(0);
        let err = sections.unmap_range(0, 0x1000).unwrap_err();
        assert!(matches!(err, CacheError::ResourceInUse));
        assert!(sections.is_mapped(0, 0x1000));
    }
}
