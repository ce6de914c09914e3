//! Eviction and trimming
//!
//! Two pressures shrink the cache. Physical trim destroys clean entries in
//! LRU order (visiting the already-unmapped pocket first) until the free
//! page line recovers to the retreat target. Virtual trim strips virtual
//! addresses from clean entries, batching contiguous ranges into single
//! unmap calls, and parks the stripped entries on the clean-unmapped list
//! so later passes skip them.
//!
//! Truncate and delete eviction detaches an object's entries outright;
//! entries still referenced by I/O buffers are parked on the pending
//! removal list and destroyed once the last reference drops.

use crate::cache::{EvictionMode, PageCache};
use crate::entry::{CacheEntry, HookTag, FLAG_MAPPED};
use crate::lists::GlobalListKind;
use crate::mm::MemoryWarningLevel;
use crate::object::{FileObject, ObjectPages};
use pageio_common::{CacheError, Result, VirtAddr};
use std::sync::Arc;
use tracing::{debug, trace};

impl PageCache {
    /// Whether the cache is crowding out the rest of the system. Returns
    /// the free physical page count when it is.
    pub(crate) fn is_too_big(&self) -> Option<u64> {
        // Never shrink below the minimum; performance suffers too much
        // with no cache at all.
        if self.physical_pages.load(std::sync::atomic::Ordering::SeqCst)
            <= self.limits.minimum_pages
        {
            return None;
        }

        let free = self.mm.free_physical_pages();
        if free > self.limits.headroom_pages_trigger {
            return None;
        }

        Some(free)
    }

    /// Whether the cache holds too much of the kernel virtual space.
    /// Returns the free virtual page count when it does.
    pub(crate) fn is_too_mapped(&self) -> Option<u64> {
        let free = self.mm.free_virtual_bytes() / self.page_size;
        if free > self.limits.virtual_pages_trigger
            && self.mm.virtual_warning_level() == MemoryWarningLevel::None
        {
            return None;
        }

        if self.mapped_page_count() == 0 {
            return None;
        }

        Some(free)
    }

    /// Shrink the cache back to a reasonable size. Timid operation tries
    /// each object lock once without blocking; use it whenever the caller
    /// may already hold object locks.
    pub fn trim(&self, timid: bool) {
        let mut target_remove = 0u64;
        let mut free_at_check = 0u64;
        if let Some(free) = self.is_too_big() {
            free_at_check = free;
            debug_assert!(free < self.limits.headroom_pages_retreat);
            target_remove = self.limits.headroom_pages_retreat - free;
            let physical = self.physical_page_count();
            if target_remove > physical {
                target_remove = physical;
            }

            if physical - target_remove < self.limits.minimum_pages {
                target_remove = physical - self.limits.minimum_pages;
            }

            debug!(target_remove, free, "trimming page cache");

            let mut destroy: Vec<Arc<CacheEntry>> = Vec::new();
            let mut remaining = target_remove;
            self.remove_entries_from_list(
                GlobalListKind::CleanUnmapped,
                &mut destroy,
                timid,
                Some(&mut remaining),
            );
            if remaining != 0 {
                self.remove_entries_from_list(
                    GlobalListKind::CleanLru,
                    &mut destroy,
                    timid,
                    Some(&mut remaining),
                );
            }

            self.destroy_entries(destroy);
        }

        // Unmap things too if the survivors hold too much virtual space.
        self.trim_virtual(timid);

        // Below the working-set floor the cache stops giving ground and
        // asks for user pages to be paged out instead, so an allocating
        // process cannot starve it of the working set.
        let physical = self.physical_page_count();
        if target_remove != 0 && physical < self.limits.minimum_pages_target {
            let pageout = self.limits.minimum_pages_target - physical;
            debug!(pageout, "requesting pageout");
            self.mm.request_pageout(free_at_check + pageout);
        }
    }

    /// Destroy everything parked on the pending-removal list that has
    /// become destroyable.
    pub(crate) fn trim_removal_list(&self) {
        if self.lists.lock().len(GlobalListKind::Removal) == 0 {
            return;
        }

        let mut destroy = Vec::new();
        self.remove_entries_from_list(GlobalListKind::Removal, &mut destroy, false, None);
        self.destroy_entries(destroy);
    }

    /// Process one global list, moving destroyable entries onto the
    /// caller's destroy list. Stops early once `target` owner pages have
    /// been claimed.
    fn remove_entries_from_list(
        &self,
        kind: GlobalListKind,
        destroy: &mut Vec<Arc<CacheEntry>>,
        timid: bool,
        mut target: Option<&mut u64>,
    ) {
        let mut lists = self.lists.lock();
        let mut local = lists.take_list(kind);

        loop {
            if let Some(remaining) = target.as_deref() {
                if *remaining == 0 {
                    break;
                }
            }

            let Some((_, entry)) = local.pop_first() else {
                break;
            };

            // Someone re-homed the entry while it was drained.
            if entry.hook_tag() != HookTag::Local {
                continue;
            }

            entry.set_hook(HookTag::None, 0);

            // Rip off anything with a reference rather than iterating
            // over it again and again; the release puts it back. Double
            // check afterwards in case the release raced past the
            // null hook.
            if entry.references() != 0 {
                if entry.references() == 0 {
                    lists.push_tail(GlobalListKind::CleanLru, &entry);
                }

                continue;
            }

            // A dirty entry here was just marked by a writer that has
            // yet to re-home it; leave that to the writer.
            if entry.is_dirty() {
                continue;
            }

            let object = Arc::clone(entry.object());

            // Timid attempts try the lock once without dropping the list
            // lock; inversions do not matter for a single attempt.
            let mut early_guard = None;
            if timid {
                match object.pages().try_write() {
                    Some(guard) => early_guard = Some(guard),
                    None => {
                        lists.push_tail(GlobalListKind::CleanLru, &entry);
                        continue;
                    }
                }
            }

            // Reference the entry, drop the list lock, and take the
            // object lock to hold off new references and mappings.
            entry.add_reference();
            drop(lists);
            let mut object_guard = match early_guard {
                Some(guard) => guard,
                None => object.pages().write(),
            };

            let mut taken_down = false;
            let mut counted_owner = false;
            if entry.references() == 1 {
                // Unmap the page from any image sections. If a mapping
                // dirtied it, it goes back to the dirty list instead of
                // out the door. Unmapping can fail for non-paged
                // sections; skip the candidate then.
                let unmap = match object.image_sections() {
                    Some(sections) => {
                        self.mm
                            .unmap_image_sections(sections, entry.offset(), self.page_size)
                    }
                    None => Ok(false),
                };

                if let Ok(page_was_dirty) = unmap {
                    if page_was_dirty {
                        self.mark_dirty_resolved(&entry, object.id());
                    }

                    if !entry.is_dirty() {
                        // Clear any stale dirty state to keep the
                        // counters straight, then detach.
                        self.mark_clean(&entry, false);
                        if entry.in_index() {
                            self.remove_entry_from_index(&mut object_guard, &entry);
                        }

                        taken_down = true;
                        counted_owner = entry.is_owner();
                    }
                }
            }

            drop(object_guard);
            lists = self.lists.lock();

            if taken_down {
                debug_assert!(!entry.is_dirty());
                lists.remove(&entry);
                entry.set_hook(HookTag::Local, 0);
                destroy.push(Arc::clone(&entry));
                if counted_owner {
                    if let Some(remaining) = target.as_deref_mut() {
                        *remaining = remaining.saturating_sub(1);
                    }
                }
            } else if !entry.is_dirty() {
                lists.remove(&entry);
                lists.push_tail(GlobalListKind::CleanLru, &entry);
            }

            // The hook is set either way, so this cannot recurse into a
            // reinsert.
            self.release(&entry);
        }

        // Stick any remainder back on the list.
        lists.append_list(kind, local);
    }

    /// Unmap clean entries in LRU order until the free virtual line
    /// recovers, batching contiguous ranges into single unmap calls.
    fn trim_virtual(&self, timid: bool) {
        if self.lists.lock().len(GlobalListKind::CleanLru) == 0 {
            return;
        }

        let Some(free_virtual) = self.is_too_mapped() else {
            return;
        };

        let mut target_unmap = 0u64;
        if free_virtual < self.limits.virtual_pages_retreat {
            target_unmap = self.limits.virtual_pages_retreat - free_virtual;
        }

        let mapped_clean = self
            .mapped_page_count()
            .saturating_sub(self.mapped_dirty_page_count());
        if target_unmap > mapped_clean {
            target_unmap = mapped_clean;
        }

        if target_unmap == 0 {
            if self.mm.virtual_warning_level() == MemoryWarningLevel::None {
                return;
            }

            // Unmap some minimum before trusting the warning level to
            // say when the coast is clear; this builds headroom in
            // fragmented situations.
            target_unmap = self.limits.virtual_pages_retreat - self.limits.virtual_pages_trigger;
        }

        debug!(target_unmap, free_virtual, "unmapping entries");

        let page_size = self.page_size;
        let mut return_list: Vec<Arc<CacheEntry>> = Vec::new();
        let mut unmap_start: Option<VirtAddr> = None;
        let mut unmap_size = 0u64;
        let mut unmapped = 0u64;
        let mut lists = self.lists.lock();

        while unmapped != target_unmap
            || self.mm.virtual_warning_level() != MemoryWarningLevel::None
        {
            let Some(entry) = lists.peek_front(GlobalListKind::CleanLru) else {
                break;
            };

            // Rip off referenced entries; they cannot be unmapped now
            // and the release puts them back.
            if entry.references() != 0 {
                lists.remove(&entry);
                if entry.references() == 0 {
                    lists.push_tail(GlobalListKind::CleanLru, &entry);
                }

                continue;
            }

            // A dirty entry was just marked and not yet re-homed.
            if entry.is_dirty() {
                lists.remove(&entry);
                continue;
            }

            // Already unmapped: move it to the side pocket so this walk
            // stops revisiting it.
            if entry.cached_virtual().is_none() {
                lists.remove(&entry);
                lists.push_tail(GlobalListKind::CleanUnmapped, &entry);
                continue;
            }

            let object = Arc::clone(entry.object());
            let mut early_guard = None;
            if timid {
                match object.pages().try_write() {
                    Some(guard) => early_guard = Some(guard),
                    None => {
                        lists.remove(&entry);
                        entry.set_hook(HookTag::Local, 0);
                        return_list.push(entry);
                        continue;
                    }
                }
            }

            entry.add_reference();
            drop(lists);
            let object_guard = match early_guard {
                Some(guard) => guard,
                None => object.pages().write(),
            };

            let removed = self.remove_entry_virtual_address(&entry);
            drop(object_guard);

            if let Ok(Some(virtual_addr)) = removed {
                unmapped += 1;

                // Close out the previous run if this page does not
                // continue it.
                if let Some(start) = unmap_start {
                    if virtual_addr != start.offset(unmap_size) {
                        self.mm.unmap_range(start, unmap_size);
                        unmap_start = None;
                        unmap_size = 0;
                    }
                }

                if unmap_start.is_none() {
                    unmap_start = Some(virtual_addr);
                }

                unmap_size += page_size;
            }

            lists = self.lists.lock();
            if !entry.is_dirty() {
                lists.remove(&entry);
                lists.push_tail(GlobalListKind::CleanUnmapped, &entry);
            }

            self.release(&entry);
        }

        // Put back entries whose locks could not be taken.
        for entry in return_list {
            if entry.hook_tag() == HookTag::Local {
                entry.set_hook(HookTag::None, 0);
                lists.push_tail(GlobalListKind::CleanLru, &entry);
            }
        }

        drop(lists);

        // The entries already reflect being unmapped, so the trailing
        // run can be unmapped outside the lock, and the mapped count is
        // settled in bulk.
        if let Some(start) = unmap_start {
            self.mm.unmap_range(start, unmap_size);
        }

        if unmapped != 0 {
            self.mapped_pages
                .fetch_sub(unmapped, std::sync::atomic::Ordering::SeqCst);
            debug!(unmapped, "unmapped entries");
        }
    }

    /// Separate one entry from its virtual address. The entry's object
    /// lock is held; the backing entry's lock is taken here when the
    /// entry borrows. Refuses with `ResourceInUse` when references or
    /// dirty state make the address indispensable.
    fn remove_entry_virtual_address(&self, entry: &Arc<CacheEntry>) -> Result<Option<VirtAddr>> {
        if entry.references() != 1 || entry.is_dirty() {
            return Err(CacheError::ResourceInUse);
        }

        if entry.is_owner() {
            // No references means it backs nobody; freely unmap.
            let old = entry.clear_flags(FLAG_MAPPED);
            if old & FLAG_MAPPED == 0 {
                return Ok(None);
            }

            let virtual_addr = entry.cached_virtual();
            entry.store_virtual(None);
            return Ok(virtual_addr);
        }

        // Not the owner; the owner is only eligible if its sole
        // reference is ours. Files are locked before block devices, so
        // taking the backing lock here nests correctly.
        let Some(backing) = entry.backing() else {
            return Ok(None);
        };

        let backing_object = Arc::clone(backing.object());
        let _backing_guard = backing_object.pages().write();

        if backing.references() != 1 || backing.is_dirty() {
            return Err(CacheError::ResourceInUse);
        }

        // Only the owner carries the mapped flag.
        debug_assert!(!entry.is_mapped() && !entry.is_dirty());

        let old = backing.clear_flags(FLAG_MAPPED);
        entry.store_virtual(None);
        if old & FLAG_MAPPED == 0 {
            return Ok(None);
        }

        let virtual_addr = backing.cached_virtual();
        backing.store_virtual(None);
        Ok(virtual_addr)
    }

    /// Drop every cache entry of `object` at or past `offset`. Modes
    /// differ only in what references are expected: truncate tolerates
    /// outstanding I/O buffer references, delete expects none, best
    /// effort skips referenced entries entirely.
    pub fn evict(&self, object: &Arc<FileObject>, offset: u64, mode: EvictionMode) {
        if !object.object_type().is_cacheable() {
            return;
        }

        let mut pages = object.pages().write();
        if pages.is_empty() {
            return;
        }

        debug!(
            object = %object.id(),
            offset = format_args!("{offset:#x}"),
            ?mode,
            "evicting entries"
        );

        let mut destroy: Vec<Arc<CacheEntry>> = Vec::new();
        let mut cursor: Option<u64> = None;
        loop {
            let entry = match cursor {
                None => pages.search_closest(offset).cloned(),
                Some(position) => pages.next_after(position).cloned(),
            };

            let Some(entry) = entry else {
                break;
            };

            cursor = Some(entry.offset());
            debug_assert!(entry.offset() >= offset);

            if mode == EvictionMode::BestEffort && entry.references() != 0 {
                trace!(
                    offset = format_args!("{:#x}", entry.offset()),
                    references = entry.references(),
                    "skip evicting referenced entry"
                );
                continue;
            }

            // Clean the page to keep the statistics accurate; it is
            // evicted, not written. It goes to the removal or destroy
            // list, not the clean LRU.
            self.mark_clean(&entry, false);
            debug_assert!(mode != EvictionMode::Delete || entry.references() == 0);

            // Off the index it cannot be found again.
            self.remove_entry_from_index(&mut pages, &entry);

            let mut lists = self.lists.lock();
            debug_assert!(!entry.is_dirty());
            lists.remove(&entry);
            if entry.references() == 0 {
                entry.set_hook(HookTag::Local, 0);
                destroy.push(Arc::clone(&entry));
            } else {
                lists.push_tail(GlobalListKind::Removal, &entry);
            }
        }

        drop(pages);
        self.destroy_entries(destroy);
    }

    /// Detach an entry from its object's index. The object lock is held
    /// exclusively. Removal is final.
    pub(crate) fn remove_entry_from_index(
        &self,
        pages: &mut ObjectPages,
        entry: &Arc<CacheEntry>,
    ) {
        debug_assert!(entry.in_index());
        let removed = pages.remove(entry.offset());
        debug_assert!(removed.is_some());
        entry.set_in_index(false);
        self.entry_count
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        trace!(
            object = %entry.object().id(),
            offset = format_args!("{:#x}", entry.offset()),
            "removed entry from index"
        );
    }

    /// Destroy a batch of detached, unreferenced entries.
    pub(crate) fn destroy_entries(&self, list: Vec<Arc<CacheEntry>>) {
        let count = list.len();
        for entry in list {
            // Unreachable now: no index membership, no references, and
            // the hook names the local destroy list.
            entry.set_hook(HookTag::None, 0);
            trace!(
                object = %entry.object().id(),
                offset = format_args!("{:#x}", entry.offset()),
                flags = format_args!("{:#x}", entry.flags()),
                "destroying entry"
            );
            self.destroy_entry(&entry);
        }

        if count != 0 {
            debug!(count, "removed entries");
        }
    }

    /// Release everything a single entry holds: the virtual address and
    /// physical page when it owns them, the backing reference when it
    /// borrows, and finally the entry record itself.
    fn destroy_entry(&self, entry: &Arc<CacheEntry>) {
        debug_assert!(!entry.is_dirty());
        debug_assert_eq!(entry.references(), 0);
        debug_assert!(!entry.in_index());

        if entry.is_owner() {
            if entry.is_mapped() {
                if let Some(virtual_addr) = entry.cached_virtual() {
                    self.mm.unmap_range(virtual_addr, self.page_size);
                }

                entry.clear_flags(FLAG_MAPPED);
                entry.store_virtual(None);
                self.mapped_pages
                    .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }

            self.mm.free_page(entry.physical());
            self.physical_pages
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        } else if let Some(backing) = entry.take_backing() {
            debug_assert_eq!(entry.physical(), backing.physical());
            self.release(&backing);
        }

        // The object reference travels with the record; both go when the
        // last Arc does.
        self.allocator.recycle();
    }
}
