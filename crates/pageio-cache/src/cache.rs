//! The page cache proper
//!
//! One [`PageCache`] instance exists per process. It owns the global entry
//! lists, the four usage counters, the entry allocator, and the background
//! worker handle; the per-object indices live on the objects themselves.
//!
//! Entries handed out by lookup and creation carry a reference that the
//! caller must return through [`PageCache::release`]. Dropping the last
//! reference parks a clean, index-attached entry at the tail of the clean
//! LRU where the trim engine can find it.

use crate::alloc::EntryAllocator;
use crate::config::{Limits, Tunables};
use crate::entry::{CacheEntry, HookTag, FLAG_DIRTY, FLAG_MAPPED, FLAG_OWNER};
use crate::io::NonCachedIo;
use crate::io_buffer::IoBuffer;
use crate::lists::{GlobalListKind, GlobalLists};
use crate::mm::MemoryManager;
use crate::object::{FileObject, ObjectPages};
use crate::worker::{WorkerSignal, STATE_CLEAN, STATE_DIRTY};
use crossbeam_channel::{unbounded, Receiver, Sender};
use pageio_common::{align_up, ObjectId, ObjectType, PhysAddr, Result, VirtAddr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Instant;
use tracing::{debug, trace};

/// How forcefully [`PageCache::evict`] treats entries that still have
/// references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Skip entries with outstanding references
    BestEffort,
    /// Detach everything; outstanding I/O buffer references are expected
    /// and keep the detached entries alive until released
    Truncate,
    /// Detach everything; no outstanding references are expected
    Delete,
}

/// The process-wide page cache.
pub struct PageCache {
    pub(crate) mm: Arc<dyn MemoryManager>,
    pub(crate) io: Arc<dyn NonCachedIo>,
    pub(crate) tunables: Tunables,
    pub(crate) limits: Limits,
    pub(crate) page_size: u64,
    pub(crate) allocator: EntryAllocator,
    /// The global list lock and everything it protects
    pub(crate) lists: Mutex<GlobalLists>,
    /// Entries resident in any object's index
    pub(crate) entry_count: AtomicU64,
    /// Physical pages owned by the cache, including pages awaiting
    /// destruction
    pub(crate) physical_pages: AtomicU64,
    pub(crate) dirty_pages: AtomicU64,
    pub(crate) mapped_pages: AtomicU64,
    pub(crate) mapped_dirty_pages: AtomicU64,
    /// Objects with dirty cached data, visited by the worker's flush pass
    pub(crate) dirty_objects: Mutex<HashMap<ObjectId, Weak<FileObject>>>,
    /// Worker scheduling state, STATE_CLEAN or STATE_DIRTY
    pub(crate) sched_state: AtomicU8,
    /// Microseconds since construction of the last cleaning attempt
    pub(crate) last_clean_us: AtomicU64,
    pub(crate) started_at: Instant,
    pub(crate) signal_tx: Sender<WorkerSignal>,
    pub(crate) signal_rx: Mutex<Option<Receiver<WorkerSignal>>>,
    pub(crate) worker_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) worker_thread: Mutex<Option<ThreadId>>,
}

impl PageCache {
    /// Create a cache over the given collaborators. The worker is not
    /// running until [`start`](crate::worker) is called.
    pub fn new(
        mm: Arc<dyn MemoryManager>,
        io: Arc<dyn NonCachedIo>,
        tunables: Tunables,
    ) -> Arc<Self> {
        let page_size = mm.page_size();
        let limits = Limits::compute(
            &tunables,
            mm.total_physical_pages(),
            mm.total_virtual_bytes(),
            page_size,
        );
        let (signal_tx, signal_rx) = unbounded();
        let entry_limit = tunables.entry_limit;

        debug!(
            page_size,
            trigger = limits.headroom_pages_trigger,
            retreat = limits.headroom_pages_retreat,
            minimum = limits.minimum_pages,
            "page cache initialized"
        );

        Arc::new(Self {
            mm,
            io,
            tunables,
            limits,
            page_size,
            allocator: EntryAllocator::new(entry_limit),
            lists: Mutex::new(GlobalLists::default()),
            entry_count: AtomicU64::new(0),
            physical_pages: AtomicU64::new(0),
            dirty_pages: AtomicU64::new(0),
            mapped_pages: AtomicU64::new(0),
            mapped_dirty_pages: AtomicU64::new(0),
            dirty_objects: Mutex::new(HashMap::new()),
            sched_state: AtomicU8::new(STATE_CLEAN),
            last_clean_us: AtomicU64::new(0),
            started_at: Instant::now(),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            worker_handle: Mutex::new(None),
            worker_thread: Mutex::new(None),
        })
    }

    /// Size of the data held by each cache entry.
    pub fn entry_data_size(&self) -> u64 {
        self.page_size
    }

    /// Entries resident in any object's index.
    pub fn resident_entries(&self) -> u64 {
        self.entry_count.load(Ordering::SeqCst)
    }

    /// Physical pages owned by the cache.
    pub fn physical_page_count(&self) -> u64 {
        self.physical_pages.load(Ordering::SeqCst)
    }

    /// Dirty pages in the cache.
    pub fn dirty_page_count(&self) -> u64 {
        self.dirty_pages.load(Ordering::SeqCst)
    }

    /// Cache pages counted as mapped.
    pub fn mapped_page_count(&self) -> u64 {
        self.mapped_pages.load(Ordering::SeqCst)
    }

    /// Mapped pages that are also dirty.
    pub fn mapped_dirty_page_count(&self) -> u64 {
        self.mapped_dirty_pages.load(Ordering::SeqCst)
    }

    pub(crate) fn on_worker_thread(&self) -> bool {
        self.worker_thread
            .lock()
            .map_or(false, |id| id == std::thread::current().id())
    }

    /// Search the object's index. On a hit a reference is taken and the
    /// entry's LRU position is refreshed.
    pub fn lookup(&self, object: &Arc<FileObject>, offset: u64) -> Option<Arc<CacheEntry>> {
        let pages = object.pages().read();
        let found = pages.search(offset).cloned();
        if let Some(entry) = &found {
            entry.add_reference();
            self.update_entry_list(entry, false);
            trace!(
                object = %object.id(),
                offset = format_args!("{offset:#x}"),
                references = entry.references(),
                flags = format_args!("{:#x}", entry.flags()),
                "lookup hit"
            );
        } else {
            trace!(
                object = %object.id(),
                offset = format_args!("{offset:#x}"),
                "lookup miss"
            );
        }

        found
    }

    /// Install a page for (object, offset), or return the entry that beat
    /// us to it. The returned entry carries a reference either way.
    pub fn create_or_lookup(
        &self,
        object: &Arc<FileObject>,
        virtual_addr: Option<VirtAddr>,
        physical: PhysAddr,
        offset: u64,
        link_entry: Option<&Arc<CacheEntry>>,
    ) -> Result<(Arc<CacheEntry>, bool)> {
        let mut pages = object.pages().write();
        self.create_or_lookup_locked(object, &mut pages, virtual_addr, physical, offset, link_entry)
    }

    pub(crate) fn create_or_lookup_locked(
        &self,
        object: &Arc<FileObject>,
        pages: &mut ObjectPages,
        virtual_addr: Option<VirtAddr>,
        physical: PhysAddr,
        offset: u64,
        link_entry: Option<&Arc<CacheEntry>>,
    ) -> Result<(Arc<CacheEntry>, bool)> {
        debug_assert!(link_entry.map_or(true, |link| link.physical() == physical));

        let candidate =
            self.allocator
                .allocate(Arc::clone(object), self.usable_va(virtual_addr), physical, offset)?;

        if let Some(existing) = pages.search(offset).cloned() {
            // Someone beat us to the punch; discard the candidate.
            self.allocator.recycle();
            existing.add_reference();
            self.update_entry_list(&existing, false);
            debug!(
                object = %object.id(),
                offset = format_args!("{offset:#x}"),
                "insert found existing entry"
            );
            return Ok((existing, false));
        }

        self.insert_entry(pages, &candidate, link_entry);
        self.update_entry_list(&candidate, true);
        debug!(
            object = %object.id(),
            offset = format_args!("{offset:#x}"),
            physical = %physical,
            "inserted new entry"
        );
        Ok((candidate, true))
    }

    /// Install a page the caller has proven cannot collide (for example a
    /// freshly extended region). The returned entry carries a reference.
    pub fn create_and_insert(
        &self,
        object: &Arc<FileObject>,
        virtual_addr: Option<VirtAddr>,
        physical: PhysAddr,
        offset: u64,
        link_entry: Option<&Arc<CacheEntry>>,
    ) -> Result<Arc<CacheEntry>> {
        let mut pages = object.pages().write();
        debug_assert!(pages.search(offset).is_none());
        debug_assert!(link_entry.map_or(true, |link| link.physical() == physical));

        let entry =
            self.allocator
                .allocate(Arc::clone(object), self.usable_va(virtual_addr), physical, offset)?;
        self.insert_entry(&mut pages, &entry, link_entry);
        self.update_entry_list(&entry, true);
        debug!(
            object = %object.id(),
            offset = format_args!("{offset:#x}"),
            physical = %physical,
            "inserted new entry"
        );
        Ok(entry)
    }

    fn usable_va(&self, virtual_addr: Option<VirtAddr>) -> Option<VirtAddr> {
        if self.tunables.disable_virtual_addresses {
            None
        } else {
            virtual_addr
        }
    }

    /// Wire a fresh entry into the index and assign page ownership,
    /// linking it to an existing entry of the other level when supplied.
    /// The object lock is held exclusively.
    fn insert_entry(
        &self,
        pages: &mut ObjectPages,
        entry: &Arc<CacheEntry>,
        link_entry: Option<&Arc<CacheEntry>>,
    ) {
        debug_assert_eq!(entry.flags(), 0);
        pages.insert(Arc::clone(entry));
        entry.set_in_index(true);
        self.entry_count.fetch_add(1, Ordering::SeqCst);

        let Some(link) = link_entry else {
            if entry.cached_virtual().is_some() {
                entry.set_flags(FLAG_MAPPED);
                self.mapped_pages.fetch_add(1, Ordering::SeqCst);
            }

            entry.set_flags(FLAG_OWNER);
            self.physical_pages.fetch_add(1, Ordering::SeqCst);
            return;
        };

        let link_type = link.object().object_type();
        let new_type = entry.object().object_type();
        debug_assert_ne!(link_type, new_type);
        debug_assert!(link_type.is_linkable() && new_type.is_linkable());
        debug_assert!(link.is_owner());
        debug_assert_eq!(link.physical(), entry.physical());

        if link_type == ObjectType::BlockDevice && new_type.is_cacheable_file() {
            // The device entry below keeps the page; the new file entry
            // borrows it.
            link.add_reference();
            entry.set_backing(Arc::clone(link));
        } else {
            // A device entry inserted under an existing file entry takes
            // over ownership; the file entry is demoted to a borrower.
            debug_assert!(link_type.is_cacheable_file());
            debug_assert_eq!(new_type, ObjectType::BlockDevice);

            entry.add_reference();
            link.set_backing(Arc::clone(entry));
            let old = link.clear_flags(FLAG_OWNER | FLAG_MAPPED);
            // A dirty borrower would corrupt the accounting.
            debug_assert_eq!(old & FLAG_DIRTY, 0);
            entry.set_flags(FLAG_OWNER);
            if old & FLAG_MAPPED != 0 {
                // The mapping accounting moves to the new owner together
                // with the virtual address.
                let virtual_addr = link.cached_virtual();
                debug_assert!(virtual_addr.is_some());
                entry.store_virtual(virtual_addr);
                entry.set_flags(FLAG_MAPPED);
            }
        }
    }

    /// Refresh an entry's list position after lookup or creation.
    fn update_entry_list(&self, entry: &Arc<CacheEntry>, created: bool) {
        let mut lists = self.lists.lock();
        if created {
            debug_assert_eq!(entry.hook_tag(), HookTag::None);
            debug_assert!(!entry.is_dirty());
            lists.push_tail(GlobalListKind::CleanLru, entry);
            return;
        }

        // A clean entry on a clean list moves to the back; a clean entry
        // off all lists was ripped off because it has references and will
        // be reinserted at release.
        if !entry.is_dirty()
            && matches!(
                entry.hook_tag(),
                HookTag::CleanLru | HookTag::CleanUnmapped
            )
        {
            lists.move_to_clean_tail(entry);
        }
    }

    /// Take an additional reference. The caller must already hold a
    /// reference or the object lock.
    pub fn acquire(&self, entry: &Arc<CacheEntry>) {
        entry.add_reference();
    }

    /// Return a reference. If this was the last one and the entry is
    /// clean and off all lists, it is parked at the tail of the clean LRU.
    pub fn release(&self, entry: &Arc<CacheEntry>) {
        let old = entry.drop_reference();
        if old != 1 || entry.hook_tag() != HookTag::None || entry.is_dirty() {
            return;
        }

        let mut lists = self.lists.lock();
        // Re-test under the lock; a concurrent mark-dirty or lookup can
        // race the unlocked checks.
        if entry.references() == 0 && entry.hook_tag() == HookTag::None && !entry.is_dirty() {
            lists.push_tail(GlobalListKind::CleanLru, entry);
        }
    }

    /// Mark an entry dirty, resolving to the owner of the physical page.
    /// Returns false if it was already dirty. The caller must not hold
    /// the object lock.
    pub fn mark_dirty(&self, entry: &Arc<CacheEntry>) -> bool {
        let mut target = if entry.is_owner() {
            Arc::clone(entry)
        } else {
            entry.backing().unwrap_or_else(|| Arc::clone(entry))
        };

        loop {
            if target.is_dirty() {
                return false;
            }

            let object = Arc::clone(target.object());
            let guard = object.pages().write();

            // The backing relationship may have been established while we
            // waited for the lock; chase it and take the right lock.
            if let Some(backing) = target.backing() {
                drop(guard);
                target = backing;
                continue;
            }

            let marked = self.mark_dirty_locked(&target);
            drop(guard);
            return marked;
        }
    }

    /// Dirty transition with the owner's object lock already held (any
    /// mode). `entry` must be the page owner.
    pub(crate) fn mark_dirty_locked(&self, entry: &Arc<CacheEntry>) -> bool {
        let old = entry.set_flags(FLAG_DIRTY);
        debug_assert_ne!(old & FLAG_OWNER, 0);
        if old & FLAG_DIRTY != 0 {
            return false;
        }

        self.dirty_pages.fetch_add(1, Ordering::SeqCst);
        if old & FLAG_MAPPED != 0 {
            self.mapped_dirty_pages.fetch_add(1, Ordering::SeqCst);
        }

        {
            let mut lists = self.lists.lock();
            lists.remove(entry);
            lists.push_dirty(entry);
        }

        self.note_dirty_object(entry.object());
        true
    }

    /// Resolve to the page owner and mark it dirty. `locked_object` names
    /// the object whose lock the caller already holds, so the lock is not
    /// re-taken for entries of that object.
    pub(crate) fn mark_dirty_resolved(
        &self,
        entry: &Arc<CacheEntry>,
        locked_object: ObjectId,
    ) -> bool {
        let mut target = if entry.is_owner() {
            Arc::clone(entry)
        } else {
            entry.backing().unwrap_or_else(|| Arc::clone(entry))
        };

        loop {
            if target.is_dirty() {
                return false;
            }

            if target.object().id() == locked_object {
                return self.mark_dirty_locked(&target);
            }

            let object = Arc::clone(target.object());
            let guard = object.pages().write();
            if let Some(backing) = target.backing() {
                drop(guard);
                target = backing;
                continue;
            }

            let marked = self.mark_dirty_locked(&target);
            drop(guard);
            return marked;
        }
    }

    /// Mark an entry clean. Returns false if it was already clean.
    /// Callers either hold a reference or the object lock. Pass
    /// `requeue = false` when the entry is headed for another list.
    pub fn mark_clean(&self, entry: &Arc<CacheEntry>, requeue: bool) -> bool {
        // Quick exit before banging around atomically.
        if !entry.is_dirty() {
            return false;
        }

        let old = entry.clear_flags(FLAG_DIRTY);
        if old & FLAG_DIRTY == 0 {
            return false;
        }

        debug_assert_ne!(old & FLAG_OWNER, 0);
        self.dirty_pages.fetch_sub(1, Ordering::SeqCst);
        if old & FLAG_MAPPED != 0 {
            self.mapped_dirty_pages.fetch_sub(1, Ordering::SeqCst);
        }

        let mut lists = self.lists.lock();
        lists.remove(entry);
        if requeue {
            // Dirty pages were recently used; park at the LRU tail.
            lists.push_tail(GlobalListKind::CleanLru, entry);
        }

        true
    }

    /// Offer a virtual address for the entry's physical page. The offer
    /// lands on the page owner. Returns true if the address was taken;
    /// false means an address is already recorded (or VAs are disabled)
    /// and the caller still owns the mapping.
    pub fn set_va(&self, entry: &Arc<CacheEntry>, virtual_addr: VirtAddr) -> bool {
        debug_assert!(virtual_addr.is_aligned(self.page_size));

        if entry.cached_virtual().is_some() || self.tunables.disable_virtual_addresses {
            return false;
        }

        let owner = entry.backing().unwrap_or_else(|| Arc::clone(entry));
        let old = owner.set_flags(FLAG_MAPPED);
        debug_assert_ne!(old & FLAG_OWNER, 0);

        let mut set = false;
        if old & FLAG_MAPPED == 0 {
            set = true;
            owner.store_virtual(Some(virtual_addr));
            self.mapped_pages.fetch_add(1, Ordering::SeqCst);
            if old & FLAG_DIRTY != 0 {
                self.mapped_dirty_pages.fetch_add(1, Ordering::SeqCst);
            }
        }

        // Sync the borrower's cached copy; rival writers all store the
        // same value.
        if !Arc::ptr_eq(&owner, entry) {
            if let Some(owner_va) = owner.cached_virtual() {
                debug_assert!(!entry.is_mapped());
                entry.store_virtual(Some(owner_va));
            }
        }

        set
    }

    /// The entry's virtual address, if mapped.
    pub fn get_va(&self, entry: &Arc<CacheEntry>) -> Option<VirtAddr> {
        entry.virtual_address()
    }

    /// The entry's physical address.
    pub fn get_pa(&self, entry: &Arc<CacheEntry>) -> PhysAddr {
        entry.physical()
    }

    /// The entry's offset within its object.
    pub fn get_offset(&self, entry: &Arc<CacheEntry>) -> u64 {
        entry.offset()
    }

    /// Share one physical page between a block-device entry and the file
    /// entry stacked above it. On success the upper entry borrows the
    /// page, the lower entry owns it, and the lower entry's old page is
    /// freed. Returns true when the two are linked (including when they
    /// already were).
    pub fn link(&self, lower: &Arc<CacheEntry>, upper: &Arc<CacheEntry>) -> bool {
        let lower_type = lower.object().object_type();
        let upper_type = upper.object().object_type();
        if lower_type == upper_type {
            return false;
        }

        if lower_type != ObjectType::BlockDevice || !upper_type.is_cacheable_file() {
            return false;
        }

        debug_assert!(lower.references() > 0 && upper.references() > 0);

        // File-level lock first, then the device below it.
        let upper_object = Arc::clone(upper.object());
        let lower_object = Arc::clone(lower.object());
        let _upper_guard = upper_object.pages().write();
        let _lower_guard = lower_object.pages().write();

        if let Some(existing) = upper.backing() {
            return Arc::ptr_eq(&existing, lower);
        }

        // More than one reference means outstanding I/O buffers hold the
        // lower entry's physical address; swapping it would invalidate
        // them. New references are excluded by the lock held above.
        if lower.references() != 1 {
            return false;
        }

        debug_assert!(lower.is_owner() && upper.is_owner());

        // Nobody may have the device page mmapped; it is about to be
        // freed.
        if let Some(sections) = lower_object.image_sections() {
            if self
                .mm
                .unmap_image_sections(sections, lower.offset(), self.page_size)
                .is_err()
            {
                return false;
            }
        }

        debug_assert!(!upper.is_dirty());

        let lower_flags = lower.flags();
        let upper_flags = upper.flags();
        let delta = lower_flags ^ upper_flags;

        // If only the lower entry is mapped, that mapping dies with its
        // page.
        if delta & lower_flags & FLAG_MAPPED != 0 {
            let old = lower.clear_flags(FLAG_MAPPED);
            if old & FLAG_MAPPED != 0 {
                self.mapped_pages.fetch_sub(1, Ordering::SeqCst);
                if old & FLAG_DIRTY != 0 {
                    self.mapped_dirty_pages.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        // The lower entry adopts the upper entry's page.
        let old_physical = lower.physical();
        let old_virtual = lower.cached_virtual();
        lower.set_physical(upper.physical());
        lower.store_virtual(upper.cached_virtual());

        // Ownership and mapping accounting move below.
        let old = upper.clear_flags(FLAG_MAPPED | FLAG_OWNER);
        if old & FLAG_MAPPED != 0 {
            self.mapped_pages.fetch_sub(1, Ordering::SeqCst);
            if delta & FLAG_MAPPED != 0 {
                let previous = lower.set_flags(FLAG_MAPPED);
                if previous & FLAG_MAPPED == 0 {
                    self.mapped_pages.fetch_add(1, Ordering::SeqCst);
                    if previous & FLAG_DIRTY != 0 {
                        self.mapped_dirty_pages.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }

        debug_assert!(upper.backing().is_none());
        lower.add_reference();
        upper.set_backing(Arc::clone(lower));

        // Retire the lower entry's old page.
        if let Some(virtual_addr) = old_virtual {
            self.mm.unmap_range(virtual_addr, self.page_size);
        }

        if old_physical != upper.physical() {
            self.mm.free_page(old_physical);
            self.physical_pages.fetch_sub(1, Ordering::SeqCst);
        }

        debug!(
            lower_object = %lower_object.id(),
            lower_offset = format_args!("{:#x}", lower.offset()),
            upper_object = %upper_object.id(),
            upper_offset = format_args!("{:#x}", upper.offset()),
            "linked entries"
        );
        true
    }

    /// Back-fill the cache from a buffer freshly read from the device,
    /// sharing the cached pages into `destination` for the requested copy
    /// window. Returns the bytes made visible in the destination.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_and_cache(
        &self,
        object: &Arc<FileObject>,
        file_offset: u64,
        destination: &mut IoBuffer,
        copy_size: u64,
        source: &mut IoBuffer,
        source_size: u64,
        source_copy_offset: u64,
    ) -> Result<u64> {
        let page_size = self.page_size;
        debug_assert!(source_size % page_size == 0);
        debug_assert!(copy_size % page_size == 0);

        let mut pages = object.pages().write();
        let mut bytes_copied = 0u64;
        let mut copy_remaining = copy_size;
        let mut copy_offset = source_copy_offset;
        let mut source_offset = 0u64;
        let mut file_offset = file_offset;

        while source_offset < source_size {
            let Some(physical) = source.page_physical(source_offset) else {
                break;
            };

            // If the source page is already cache backed, the new entry
            // shares its page; otherwise the new entry takes the page
            // over from the buffer.
            let source_entry = source.page_cache_entry(source_offset).cloned();
            debug_assert!(source_entry
                .as_ref()
                .map_or(true, |e| e.physical() == physical));

            // Prefer the source entry's virtual address; fall back to the
            // buffer's mapping and transfer it to the source entry.
            let mut virtual_addr = source_entry.as_ref().and_then(|e| e.virtual_address());
            if virtual_addr.is_none() {
                if let Some(buffer_va) = source.page_virtual(source_offset) {
                    virtual_addr = Some(buffer_va);
                    if let Some(src) = &source_entry {
                        self.set_va(src, buffer_va);
                    }
                }
            }

            let (entry, created) = self.create_or_lookup_locked(
                object,
                &mut pages,
                virtual_addr,
                physical,
                file_offset,
                source_entry.as_ref(),
            )?;

            // Without this back-reference the source buffer would free a
            // physical page the cache now owns.
            if created && source_entry.is_none() {
                source.set_page_cache_entry(source_offset, &entry);
            }

            if source_offset == copy_offset && copy_remaining != 0 {
                destination.append_entry(&entry);
                copy_offset += page_size;
                copy_remaining -= page_size;
                bytes_copied += page_size;
            }

            // The buffer appends took their own references.
            self.release(&entry);
            file_offset += page_size;
            source_offset += page_size;
        }

        Ok(bytes_copied)
    }

    /// Copy up to one page of data into a cache entry and mark it dirty.
    pub fn copy_into_entry(&self, entry: &Arc<CacheEntry>, page_offset: usize, data: &[u8]) {
        debug_assert!(page_offset as u64 + data.len() as u64 <= self.page_size);
        self.mm.write_page(entry.physical(), page_offset, data);
        self.mark_dirty(entry);
    }

    /// Whether the buffer's pages are exactly the cache's pages for
    /// (object, offset..offset+size). Used by read paths to skip copies.
    pub fn is_io_buffer_cache_backed(
        &self,
        object: &Arc<FileObject>,
        buffer: &IoBuffer,
        offset: u64,
        size: u64,
    ) -> bool {
        let page_size = self.page_size;
        let aligned = align_up(size, page_size);
        let mut buffer_offset = 0u64;
        let mut object_offset = offset;
        while buffer_offset < aligned {
            match buffer.page_cache_entry(buffer_offset) {
                Some(entry)
                    if Arc::ptr_eq(entry.object(), object)
                        && entry.in_index()
                        && entry.offset() == object_offset => {}
                _ => return false,
            }

            buffer_offset += page_size;
            object_offset += page_size;
        }

        true
    }

    /// Whether the cache holds an uncomfortable number of dirty pages.
    /// Dirty pages keep the cache from shrinking when memory gets tight,
    /// so writers consult this as admission control.
    pub fn is_too_dirty(&self) -> bool {
        // The worker itself is allowed to dirty everything.
        if self.on_worker_thread() {
            return self.is_too_big().is_some();
        }

        let free = self.mm.free_physical_pages();
        let physical = self.physical_pages.load(Ordering::SeqCst);
        let ideal = if free < self.limits.headroom_pages_retreat {
            physical.saturating_sub(self.limits.headroom_pages_retreat - free)
        } else {
            physical + (free - self.limits.headroom_pages_retreat)
        };

        let max_dirty = ideal >> self.tunables.max_dirty_shift;
        self.dirty_pages.load(Ordering::SeqCst) >= max_dirty
    }

    /// Record that an object has dirty cached data and make sure the
    /// worker will visit it.
    pub(crate) fn note_dirty_object(&self, object: &Arc<FileObject>) {
        object.set_dirty_data(true);
        self.dirty_objects
            .lock()
            .insert(object.id(), Arc::downgrade(object));
        self.schedule_worker();
    }

    /// Schedule a cleaning for some time in the future. The writer that
    /// flips the state from clean to dirty queues the timer.
    pub fn schedule_worker(&self) {
        if self.sched_state.load(Ordering::SeqCst) == STATE_DIRTY {
            return;
        }

        if self
            .sched_state
            .compare_exchange(STATE_CLEAN, STATE_DIRTY, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.signal_tx.send(WorkerSignal::Arm);
        }
    }

    pub(crate) fn elapsed_us(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let _ = self.signal_tx.send(WorkerSignal::Shutdown);
        let handle = self.worker_handle.get_mut().take();
        if let Some(handle) = handle {
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[test]
    fn test_read_miss_then_hit() {
        let harness = Harness::new();
        let file = harness.file(0x2000);

        assert!(harness.cache.lookup(&file, 0).is_none());

        // Read path installs the page it just read from the device.
        let physical = harness.page_with(0x7e);
        let entry = harness
            .cache
            .create_and_insert(&file, None, physical, 0, None)
            .unwrap();

        let hit = harness.cache.lookup(&file, 0).unwrap();
        assert!(Arc::ptr_eq(&hit, &entry));
        assert!(hit.is_owner());
        assert!(!hit.is_dirty());
        assert_eq!(harness.cache.resident_entries(), 1);
        assert_eq!(harness.cache.physical_page_count(), 1);

        harness.cache.release(&hit);
        harness.cache.release(&entry);
    }

    #[test]
    fn test_create_or_lookup_collision() {
        let harness = Harness::new();
        let file = harness.file(0x2000);

        let first_page = harness.page_with(0x01);
        let (first, created) = harness
            .cache
            .create_or_lookup(&file, None, first_page, 0, None)
            .unwrap();
        assert!(created);

        // A second caller with its own freshly read page loses the race
        // and gets the existing entry back.
        let second_page = harness.page_with(0x02);
        let (second, created) = harness
            .cache
            .create_or_lookup(&file, None, second_page, 0, None)
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(harness.cache.resident_entries(), 1);
        harness.mm.free_page(second_page);

        harness.cache.release(&first);
        harness.cache.release(&second);
    }

    #[test]
    fn test_release_parks_on_clean_lru() {
        let harness = Harness::new();
        let file = harness.file(0x2000);
        let entry = harness.insert_page(&file, 0, 0xaa);

        {
            // Creation already parked it; rip it off the list the way a
            // trim walk does to exercise the release-time reinsert.
            let mut lists = harness.cache.lists.lock();
            lists.remove(&entry);
        }
        assert_eq!(entry.hook_tag(), crate::entry::HookTag::None);

        harness.cache.release(&entry);
        assert_eq!(entry.references(), 0);
        assert_eq!(entry.hook_tag(), crate::entry::HookTag::CleanLru);
    }

    #[test]
    fn test_mark_dirty_and_clean_counters() {
        let harness = Harness::new();
        let file = harness.file(0x4000);
        let entry = harness.insert_page(&file, 0, 0x10);

        assert!(harness.cache.mark_dirty(&entry));
        assert!(entry.is_dirty());
        assert!(!harness.cache.mark_dirty(&entry));
        assert_eq!(harness.cache.dirty_page_count(), 1);
        assert!(file.has_dirty_data());
        {
            let lists = harness.cache.lists.lock();
            assert!(lists.dirty_contains(file.id(), 0));
        }

        assert!(harness.cache.mark_clean(&entry, true));
        assert_eq!(harness.cache.dirty_page_count(), 0);
        assert_eq!(entry.hook_tag(), crate::entry::HookTag::CleanLru);

        // Idempotent clean: a second call is a no-op and does not perturb
        // the counters.
        assert!(!harness.cache.mark_clean(&entry, true));
        assert_eq!(harness.cache.dirty_page_count(), 0);

        harness.cache.release(&entry);
    }

    #[test]
    fn test_dirty_on_borrower_promotes_to_backing() {
        let harness = Harness::new();
        let device = harness.device(0x100000);
        let file = harness.file(0x4000);

        let lower = harness.insert_page(&device, 0x5000, 0x55);
        let upper = harness
            .cache
            .create_and_insert(&file, None, lower.physical(), 0x1000, Some(&lower))
            .unwrap();
        assert!(!upper.is_owner());

        assert!(harness.cache.mark_dirty(&upper));
        assert!(!upper.is_dirty());
        assert!(lower.is_dirty());
        {
            let lists = harness.cache.lists.lock();
            assert!(lists.dirty_contains(device.id(), 0x5000));
            assert!(!lists.dirty_contains(file.id(), 0x1000));
        }

        harness.cache.release(&upper);
        harness.cache.release(&lower);
    }

    #[test]
    fn test_insert_link_file_over_block() {
        let harness = Harness::new();
        let device = harness.device(0x100000);
        let file = harness.file(0x4000);

        let lower = harness.insert_page(&device, 0x5000, 0x5a);
        assert_eq!(harness.cache.physical_page_count(), 1);

        let upper = harness
            .cache
            .create_and_insert(&file, None, lower.physical(), 0x1000, Some(&lower))
            .unwrap();

        // The device entry keeps ownership; the file entry borrows.
        assert!(lower.is_owner());
        assert!(!upper.is_owner());
        assert!(Arc::ptr_eq(&upper.backing().unwrap(), &lower));
        assert_eq!(upper.physical(), lower.physical());
        // Shared page: still one physical page.
        assert_eq!(harness.cache.physical_page_count(), 1);
        assert_eq!(lower.references(), 2);

        harness.cache.release(&upper);
        harness.cache.release(&lower);
    }

    #[test]
    fn test_insert_link_block_after_file_takes_ownership() {
        let harness = Harness::new();
        let device = harness.device(0x100000);
        let file = harness.file(0x4000);

        let upper = harness.insert_page(&file, 0x1000, 0x77);
        assert!(upper.is_owner());

        let lower = harness
            .cache
            .create_and_insert(&device, None, upper.physical(), 0x5000, Some(&upper))
            .unwrap();

        // Ownership moved down to the new device entry.
        assert!(lower.is_owner());
        assert!(!upper.is_owner());
        assert!(Arc::ptr_eq(&upper.backing().unwrap(), &lower));
        assert_eq!(harness.cache.physical_page_count(), 1);

        harness.cache.release(&upper);
        harness.cache.release(&lower);
    }

    #[test]
    fn test_link_shares_page_and_preserves_data() {
        let harness = Harness::new();
        let device = harness.device(0x100000);
        let file = harness.file(0x4000);

        let lower = harness.insert_page(&device, 0x5000, 0xd1);
        let upper = harness.insert_page(&file, 0x1000, 0xf2);
        assert_eq!(harness.cache.physical_page_count(), 2);

        assert!(harness.cache.link(&lower, &upper));

        assert!(Arc::ptr_eq(&upper.backing().unwrap(), &lower));
        assert!(!upper.is_owner());
        assert!(lower.is_owner());
        assert!(lower.references() >= 2);
        assert_eq!(lower.physical(), upper.physical());
        // The device entry's old page was freed.
        assert_eq!(harness.cache.physical_page_count(), 1);

        // Reads through both entries see the file entry's bytes.
        assert!(harness.page_bytes(&lower).iter().all(|&b| b == 0xf2));
        assert!(harness.page_bytes(&upper).iter().all(|&b| b == 0xf2));

        // Linking again is a no-op success.
        assert!(harness.cache.link(&lower, &upper));

        harness.cache.release(&upper);
        harness.cache.release(&lower);
    }

    #[test]
    fn test_link_refuses_extra_references() {
        let harness = Harness::new();
        let device = harness.device(0x100000);
        let file = harness.file(0x4000);

        let lower = harness.insert_page(&device, 0x5000, 0x01);
        let upper = harness.insert_page(&file, 0x1000, 0x02);

        // An outstanding I/O buffer reference on the lower entry blocks
        // the link.
        harness.cache.acquire(&lower);
        assert!(!harness.cache.link(&lower, &upper));
        assert!(upper.backing().is_none());
        assert_eq!(harness.cache.physical_page_count(), 2);

        harness.cache.release(&lower);
        harness.cache.release(&upper);
        harness.cache.release(&lower);
    }

    #[test]
    fn test_link_refuses_same_type() {
        let harness = Harness::new();
        let file_a = harness.file(0x4000);
        let file_b = harness.file(0x4000);

        let a = harness.insert_page(&file_a, 0, 0x01);
        let b = harness.insert_page(&file_b, 0, 0x02);
        assert!(!harness.cache.link(&a, &b));

        harness.cache.release(&a);
        harness.cache.release(&b);
    }

    #[test]
    fn test_set_va_lands_on_owner() {
        let harness = Harness::new();
        let device = harness.device(0x100000);
        let file = harness.file(0x4000);

        let lower = harness.insert_page(&device, 0x5000, 0x11);
        let upper = harness
            .cache
            .create_and_insert(&file, None, lower.physical(), 0, Some(&lower))
            .unwrap();

        let virtual_addr = harness.mm.map_page(lower.physical()).unwrap();
        assert!(harness.cache.set_va(&upper, virtual_addr));

        // The owner carries the mapped flag and the accounting; the
        // borrower only caches the address.
        assert!(lower.is_mapped());
        assert!(!upper.is_mapped());
        assert_eq!(upper.virtual_address(), Some(virtual_addr));
        assert_eq!(lower.virtual_address(), Some(virtual_addr));
        assert_eq!(harness.cache.mapped_page_count(), 1);

        // A second offer is refused.
        assert!(!harness.cache.set_va(&upper, virtual_addr));

        harness.cache.release(&upper);
        harness.cache.release(&lower);
    }

    #[test]
    fn test_set_va_disabled() {
        let mut tunables = Tunables::default();
        tunables.disable_virtual_addresses = true;
        let harness = Harness::with_tunables(tunables);
        let file = harness.file(0x2000);
        let entry = harness.insert_page(&file, 0, 0x00);

        let virtual_addr = harness.mm.map_page(entry.physical()).unwrap();
        assert!(!harness.cache.set_va(&entry, virtual_addr));
        assert!(!entry.is_mapped());
        assert_eq!(harness.cache.mapped_page_count(), 0);

        harness.cache.release(&entry);
    }

    #[test]
    fn test_copy_and_cache_backfills_and_shares() {
        let harness = Harness::new();
        let file = harness.file(0x4000);
        let page_size = 4096u64;

        // Device read produced three raw pages.
        let mut source = IoBuffer::new(page_size);
        for fill in [0xa1u8, 0xa2, 0xa3] {
            source.append_raw(harness.page_with(fill), None);
        }

        let mut destination = IoBuffer::new(page_size);
        let copied = harness
            .cache
            .copy_and_cache(
                &file,
                0,
                &mut destination,
                page_size,
                &mut source,
                3 * page_size,
                page_size,
            )
            .unwrap();
        assert_eq!(copied, page_size);

        // All three pages are now cached...
        assert_eq!(harness.cache.resident_entries(), 3);
        // ...the source buffer back-references them...
        for offset in [0, page_size, 2 * page_size] {
            assert!(source.page_cache_entry(offset).is_some());
        }
        // ...and the destination shares the middle page.
        let shared = destination.page_cache_entry(0).unwrap();
        assert_eq!(shared.offset(), page_size);
        assert!(harness
            .cache
            .is_io_buffer_cache_backed(&file, &destination, page_size, page_size));

        destination.reset(&harness.cache);
        source.reset(&harness.cache);
    }

    #[test]
    fn test_copy_into_entry_dirties() {
        let harness = Harness::new();
        let file = harness.file(0x2000);
        let entry = harness.insert_page(&file, 0, 0x00);

        harness.cache.copy_into_entry(&entry, 16, b"hello page cache");
        assert!(entry.is_dirty());
        let bytes = harness.page_bytes(&entry);
        assert_eq!(&bytes[16..32], b"hello page cache");

        harness.cache.mark_clean(&entry, true);
        harness.cache.release(&entry);
    }

    #[test]
    fn test_is_io_buffer_cache_backed_negative() {
        let harness = Harness::new();
        let file = harness.file(0x4000);
        let entry = harness.insert_page(&file, 0, 0x01);

        let mut buffer = IoBuffer::new(4096);
        buffer.append_entry(&entry);

        // Wrong offset.
        assert!(!harness
            .cache
            .is_io_buffer_cache_backed(&file, &buffer, 0x1000, 4096));
        // Raw page.
        let mut raw = IoBuffer::new(4096);
        raw.append_raw(entry.physical(), None);
        assert!(!harness.cache.is_io_buffer_cache_backed(&file, &raw, 0, 4096));
        // Matching page.
        assert!(harness.cache.is_io_buffer_cache_backed(&file, &buffer, 0, 4096));

        buffer.reset(&harness.cache);
        harness.cache.release(&entry);
    }

    #[test]
    fn test_is_too_dirty_tracks_dirty_share() {
        let harness = Harness::new();
        let file = harness.file(0x40000);
        assert!(!harness.cache.is_too_dirty());

        // With plenty of free memory the ideal size is huge; a few dirty
        // pages do not trip the check.
        let entry = harness.insert_dirty_page(&file, 0, 0x01);
        assert!(!harness.cache.is_too_dirty());

        harness.cache.mark_clean(&entry, true);
        harness.cache.release(&entry);
    }
}
