//! Dirty-page flushing
//!
//! The flush engine walks an object's dirty pages, coalesces contiguous
//! runs into a working buffer of at most `flush_max_bytes`, and hands each
//! trimmed run to the non-cached write path. A short streak of clean pages
//! is tolerated inside a run so one submission can bridge small clean
//! islands; a trailing streak is always trimmed before submission.
//!
//! Whole-object flushes drain the object's dirty list and then travel the
//! index in offset order from each drained seed, which amortizes the index
//! walk across long runs. Explicit range flushes walk the index directly.

use crate::cache::PageCache;
use crate::entry::{CacheEntry, HookTag};
use crate::io::{io_flags, IoContext};
use crate::io_buffer::IoBuffer;
use crate::object::FileObject;
use pageio_common::{align_down, CacheError, ObjectType, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

impl PageCache {
    /// Flush dirty pages of `object` in `[offset, offset + size)`. Pass
    /// `size = u64::MAX` with `offset = 0` for a whole-object flush.
    /// `page_budget`, when supplied, bounds how many pages are flushed
    /// and is decreased by the number actually flushed.
    ///
    /// Data is durably written when this returns without error; file
    /// metadata is not this engine's concern.
    pub fn flush(
        &self,
        object: &Arc<FileObject>,
        offset: u64,
        size: u64,
        flags: u32,
        page_budget: Option<&mut u64>,
    ) -> Result<()> {
        let on_worker = self.on_worker_thread();
        self.flush_internal(object, offset, size, flags, page_budget, on_worker)
    }

    pub(crate) fn flush_internal(
        &self,
        object: &Arc<FileObject>,
        offset: u64,
        size: u64,
        flags: u32,
        mut page_budget: Option<&mut u64>,
        on_worker: bool,
    ) -> Result<()> {
        debug_assert!(size == u64::MAX || offset.checked_add(size).is_some());

        // Optimistically mark the object clean; failures below re-flag it.
        let whole = offset == 0 && size == u64::MAX && page_budget.is_none();
        if whole {
            object.set_dirty_data(false);
        }

        if !object.object_type().is_cacheable() {
            return Ok(());
        }

        // Quick exit if there is nothing to flush.
        if self.lists.lock().dirty_is_empty(object.id()) {
            return Ok(());
        }

        let page_size = self.page_size;
        let flush_max = self.tunables.flush_max_bytes;
        let max_streak = self.tunables.max_clean_streak;
        let mut buffer = IoBuffer::with_capacity(page_size, flush_max);

        // Whole-object flushes pull the dirty list aside and seed index
        // runs from it; range flushes walk the index alone.
        let list_mode = offset == 0 && size == u64::MAX;
        let mut local: BTreeMap<u64, Arc<CacheEntry>> = if list_mode {
            self.lists.lock().take_dirty(object.id())
        } else {
            BTreeMap::new()
        };

        let mut guard = object.pages().read();
        let mut cursor: Option<u64> = None;
        let mut started = false;
        let mut flush_size = 0u64;
        let mut next_offset = offset;
        let mut clean_streak = 0u64;
        let mut pages_flushed = 0u64;
        let mut any_flushed = false;
        let mut total: Result<()> = Ok(());
        let mut try_again = false;

        loop {
            // Pick the next entry: continue the index run, or find a new
            // starting point.
            let current: Option<Arc<CacheEntry>> = match cursor {
                Some(position) => guard.next_after(position).cloned(),
                None if list_mode => local.pop_first().map(|(_, entry)| entry),
                None if !started => guard.search_closest(offset).cloned(),
                None => None,
            };
            started = true;

            let Some(entry) = current else {
                break;
            };

            if !list_mode && entry.offset() >= offset.saturating_add(size) {
                break;
            }

            // Decide whether this entry participates in the current run.
            let mut skip = false;
            if !entry.is_dirty() {
                skip = true;

                // A synchronized flush also writes pages whose backing
                // entry is dirty; this layer cannot mark those clean.
                if flags & io_flags::DATA_SYNCHRONIZED != 0 {
                    if let Some(backing) = entry.backing() {
                        if backing.is_dirty() {
                            skip = false;
                        }
                    }
                }

                // Tolerate a short clean streak to keep the run going.
                if flush_size != 0
                    && entry.offset() == next_offset
                    && clean_streak < max_streak
                {
                    clean_streak += 1;
                    skip = false;
                }
            } else {
                if entry.offset() + page_size <= offset {
                    skip = true;
                } else if !list_mode && entry.offset() >= offset.saturating_add(size) {
                    skip = true;
                }

                if !skip {
                    clean_streak = 0;
                }
            }

            if skip {
                cursor = if list_mode { None } else { Some(entry.offset()) };
                continue;
            }

            pages_flushed += 1;

            // Append to the run, or note the entry for after the
            // submission if it does not continue the run.
            let mut pending: Option<Arc<CacheEntry>> = None;
            if flush_size == 0 || entry.offset() == next_offset {
                buffer.append_entry(&entry);
                flush_size += page_size;
                next_offset = entry.offset() + page_size;
                if flush_size < flush_max {
                    cursor = Some(entry.offset());
                    continue;
                }
            } else {
                pending = Some(Arc::clone(&entry));
            }

            // Submit the run, minus any trailing clean streak.
            debug_assert!(flush_size > clean_streak * page_size);
            let submit = flush_size - clean_streak * page_size;
            match self.flush_buffer(object, &buffer, submit, flags) {
                Ok(()) => any_flushed = true,
                Err(error) => total = Err(error),
            }

            buffer.reset(self);
            flush_size = 0;
            clean_streak = 0;

            if let Some(limit) = page_budget.as_deref() {
                if pages_flushed >= *limit {
                    break;
                }
            }

            if let Some(pending) = pending {
                buffer.append_entry(&pending);
                flush_size = page_size;
                next_offset = pending.offset() + page_size;
                cursor = Some(pending.offset());
            } else if list_mode {
                cursor = None;
            } else {
                cursor = Some(entry.offset());
            }

            if on_worker {
                // Physical pressure re-appeared mid-flush and there is
                // enough clean inventory for eviction to make progress;
                // let the worker switch over and come back.
                let clean_pages = self
                    .physical_page_count()
                    .saturating_sub(self.dirty_page_count());
                if self.is_too_big().is_some()
                    && clean_pages > self.limits.low_memory_clean_page_minimum
                {
                    try_again = true;
                    break;
                }

                // Yield the object lock briefly so contending writers
                // can get in.
                drop(guard);
                guard = object.pages().read();
            }
        }

        // Submit whatever the loop left behind, unless it bailed out to
        // let eviction run.
        if !try_again && flush_size > clean_streak * page_size {
            let submit = flush_size - clean_streak * page_size;
            match self.flush_buffer(object, &buffer, submit, flags) {
                Ok(()) => any_flushed = true,
                Err(error) => total = Err(error),
            }
        }

        // Drained entries still sitting in the buffer were never written;
        // queue them for restoration below.
        for entry in buffer.entries() {
            if entry.hook_tag() == HookTag::Local && entry.is_dirty() {
                local.insert(entry.offset(), Arc::clone(entry));
            }
        }

        buffer.reset(self);
        drop(guard);

        // Put unprocessed drained entries back on the dirty list.
        if !local.is_empty() {
            self.lists.lock().restore_dirty(object.id(), local);
        }

        // Writes to a disk that were not synchronized need a device
        // synchronize pass.
        if any_flushed
            && object.object_type() == ObjectType::BlockDevice
            && flags & io_flags::DATA_SYNCHRONIZED == 0
        {
            if let Err(error) = self.io.synchronize(object) {
                total = Err(error);
            }
        }

        if let Some(budget) = page_budget.as_deref_mut() {
            *budget = budget.saturating_sub(pages_flushed);
        }

        if try_again && total.is_ok() {
            total = Err(CacheError::TryAgain);
        }

        // Anything that went wrong leaves the object flagged dirty so the
        // next cycle retries.
        if total.is_err() {
            self.note_dirty_object(object);
        }

        total
    }

    /// Write one coalesced buffer out. The object lock is held by the
    /// caller. Marking the pages clean up front is the commit point: a
    /// writer re-dirtying a page after it will be observed by the next
    /// pass.
    fn flush_buffer(
        &self,
        object: &Arc<FileObject>,
        buffer: &IoBuffer,
        flush_size: u64,
        flags: u32,
    ) -> Result<()> {
        debug_assert!(flush_size <= self.tunables.flush_max_bytes);
        let page_size = self.page_size;
        let Some(first) = buffer.page_cache_entry(0) else {
            return Ok(());
        };

        let file_offset = first.offset();
        let mut clean = true;
        let mut bytes_to_write = 0u64;
        let mut buffer_offset = 0u64;
        while buffer_offset < flush_size {
            let Some(entry) = buffer.page_cache_entry(buffer_offset) else {
                break;
            };

            // An entry no longer in its index was evicted by a truncate;
            // nothing from that page on gets written.
            if !entry.in_index() {
                break;
            }

            if self.mark_clean(entry, true) {
                clean = false;
            }

            bytes_to_write += page_size;
            buffer_offset += page_size;
        }

        // Never write past the end of the object.
        let file_size = object.size();
        if file_offset + bytes_to_write > file_size {
            debug_assert!(file_offset <= file_size);
            bytes_to_write = file_size.saturating_sub(file_offset);
        }

        if bytes_to_write == 0 {
            return Ok(());
        }

        // Already clean means someone else is performing the I/O, unless
        // this is a synchronized flush chasing dirty backing entries.
        if clean && flags & io_flags::DATA_SYNCHRONIZED == 0 {
            return Ok(());
        }

        let ctx = IoContext {
            buffer,
            offset: file_offset,
            size: bytes_to_write,
            flags,
        };
        let result = self.io.perform_non_cached_write(object, &ctx);
        let completed = match &result {
            Ok(done) => *done,
            Err(_) => 0,
        };

        let status: Result<()> = match result {
            Ok(done) if done == bytes_to_write => Ok(()),
            Ok(done) => Err(CacheError::ShortWrite {
                expected: bytes_to_write,
                completed: done,
            }),
            Err(error) => Err(error),
        };

        if let Err(error) = &status {
            warn!(
                object = %object.id(),
                offset = format_args!("{file_offset:#x}"),
                expected = bytes_to_write,
                completed,
                %error,
                "flush write failed"
            );

            // Re-dirty everything that did not make it out.
            let mut buffer_offset = align_down(completed, page_size);
            while buffer_offset < bytes_to_write {
                if let Some(entry) = buffer.page_cache_entry(buffer_offset) {
                    self.mark_dirty_resolved(entry, object.id());
                }
                buffer_offset += page_size;
            }
        } else {
            debug!(
                object = %object.id(),
                offset = format_args!("{file_offset:#x}"),
                size = bytes_to_write,
                "flushed"
            );
        }

        status
    }
}
