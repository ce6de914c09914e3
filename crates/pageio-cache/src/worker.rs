//! Background maintenance worker
//!
//! One thread owns all background work: it waits on a delay timer, the
//! physical-memory warning, and the virtual-memory warning, and on any of
//! them runs a cycle of removal-list draining, trimming, and flushing.
//! Writers schedule it through a clean/dirty state word so only the first
//! write after a quiet period queues the timer; the delay lets writes pool
//! before anything hits the device.

use crate::cache::PageCache;
use crate::object::FileObject;
use crossbeam_channel::{after, never, select, Receiver};
use pageio_common::{CacheError, Result};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{info, warn};

/// Nothing is pending; the next writer arms the timer.
pub(crate) const STATE_CLEAN: u8 = 0;
/// A cleaning is scheduled or in progress.
pub(crate) const STATE_DIRTY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerSignal {
    /// Arm the delay timer for a future cleaning
    Arm,
    /// Exit the worker thread
    Shutdown,
}

impl PageCache {
    /// Spawn the background worker thread. Call once after construction;
    /// later calls do nothing.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let Some(signals) = self.signal_rx.lock().take() else {
            return Ok(());
        };

        let physical = self.mm.physical_warning();
        let virtual_rx = self.mm.virtual_warning();
        let cache = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("pageio-cache-worker".into())
            .spawn(move || worker_loop(&cache, &signals, &physical, &virtual_rx))?;

        *self.worker_thread.lock() = Some(handle.thread().id());
        *self.worker_handle.lock() = Some(handle);
        Ok(())
    }

    /// One maintenance cycle: drain removals, trim, flush, and either go
    /// dormant or reschedule.
    pub(crate) fn run_worker_cycle(&self) {
        // Record the attempt; writes from before this moment are the
        // ones about to be pushed out.
        self.last_clean_us.store(self.elapsed_us(), Ordering::SeqCst);

        loop {
            // Blast away the entries that are ready for removal.
            self.trim_removal_list();

            // Shrink if memory is tight. This is the root of the worker,
            // so blocking on object locks is fine.
            self.trim(false);

            // Flush the dirty objects. A try-again means eviction should
            // get another turn first.
            let status = self.flush_dirty_objects();
            if matches!(status, Err(CacheError::TryAgain)) {
                continue;
            }

            if let Err(error) = status {
                warn!(%error, "background flush failed; will retry");
            }

            // Try to go dormant: set the state clean, then re-check
            // whether any dirtiness snuck in and reschedule if so.
            self.sched_state.store(STATE_CLEAN, Ordering::SeqCst);
            let objects_pending = !self.dirty_objects.lock().is_empty();
            if objects_pending || self.dirty_page_count() != 0 {
                self.schedule_worker();
            }

            break;
        }
    }

    /// Whole-object flush over every object currently flagged dirty.
    fn flush_dirty_objects(&self) -> Result<()> {
        let snapshot: Vec<Arc<FileObject>> = {
            let objects = self.dirty_objects.lock();
            objects.values().filter_map(Weak::upgrade).collect()
        };

        let mut total: Result<()> = Ok(());
        for object in snapshot {
            match self.flush_internal(&object, 0, u64::MAX, 0, None, true) {
                Err(CacheError::TryAgain) => return Err(CacheError::TryAgain),
                Err(error) => total = Err(error),
                Ok(()) => {}
            }
        }

        // Forget objects that came out clean, and any that have died.
        let mut objects = self.dirty_objects.lock();
        objects.retain(|id, weak| match weak.upgrade() {
            Some(object) => {
                object.has_dirty_data() || !self.lists.lock().dirty_is_empty(*id)
            }
            None => false,
        });

        total
    }
}

fn worker_loop(
    cache: &Weak<PageCache>,
    signals: &Receiver<WorkerSignal>,
    physical: &Receiver<()>,
    virtual_rx: &Receiver<()>,
) {
    info!("page cache worker started");

    let mut deadline: Option<Instant> = None;
    loop {
        let timer = match deadline {
            Some(at) => after(at.saturating_duration_since(Instant::now())),
            None => never(),
        };

        let mut run = false;
        select! {
            recv(timer) -> _ => {
                deadline = None;
                run = true;
            }
            recv(physical) -> message => {
                if message.is_err() {
                    break;
                }
                run = true;
            }
            recv(virtual_rx) -> message => {
                if message.is_err() {
                    break;
                }
                run = true;
            }
            recv(signals) -> message => match message {
                Ok(WorkerSignal::Arm) => {
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };

                    if deadline.is_none() {
                        deadline = Some(Instant::now() + cache.tunables.clean_delay);
                    }
                }
                Ok(WorkerSignal::Shutdown) | Err(_) => break,
            }
        }

        if run {
            let Some(cache) = cache.upgrade() else {
                break;
            };

            // The cycle cancels the timer; a reschedule arrives as a
            // fresh arm message.
            deadline = None;
            cache.run_worker_cycle();
        }
    }

    info!("page cache worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::mm::MemoryManager;
    use crate::testing::Harness;
    use std::time::Duration;

    fn quick_tunables() -> Tunables {
        Tunables {
            clean_delay: Duration::from_millis(50),
            ..Tunables::default()
        }
    }

    #[test]
    fn test_worker_flushes_after_delay() {
        let harness = Harness::with_tunables(quick_tunables());
        harness.cache.start().unwrap();

        let file = harness.file(0x4000);
        let entry = harness.insert_dirty_page(&file, 0, 0x5c);
        harness.cache.release(&entry);

        assert!(harness.wait_until(Duration::from_secs(5), || {
            harness.cache.dirty_page_count() == 0
        }));

        let writes = harness.store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!((writes[0].offset, writes[0].size), (0, 0x1000));
        assert!(!file.has_dirty_data());

        // The worker went dormant with nothing left pending.
        assert!(harness.wait_until(Duration::from_secs(5), || {
            harness.cache.sched_state.load(Ordering::SeqCst) == STATE_CLEAN
        }));
        assert!(harness.cache.dirty_objects.lock().is_empty());
    }

    #[test]
    fn test_worker_rearms_for_later_writes() {
        let harness = Harness::with_tunables(quick_tunables());
        harness.cache.start().unwrap();

        let file = harness.file(0x8000);
        let first = harness.insert_dirty_page(&file, 0, 0x01);
        harness.cache.release(&first);
        assert!(harness.wait_until(Duration::from_secs(5), || {
            harness.cache.dirty_page_count() == 0
        }));

        // A write after the worker quiesced schedules a fresh cycle.
        let second = harness.insert_dirty_page(&file, 0x1000, 0x02);
        harness.cache.release(&second);
        assert!(harness.wait_until(Duration::from_secs(5), || {
            harness.cache.dirty_page_count() == 0
        }));
        assert_eq!(harness.store.writes().len(), 2);
    }

    #[test]
    fn test_physical_warning_wakes_worker() {
        let harness = Harness::small_with_tunables(quick_tunables());
        harness.cache.start().unwrap();

        let file = harness.file(0x40000);
        for index in 0..20u64 {
            let entry = harness.insert_page(&file, index * 0x1000, index as u8);
            harness.cache.release(&entry);
        }
        assert_eq!(harness.cache.physical_page_count(), 20);

        // Free pages collapse below the trigger; the warning event wakes
        // the worker without waiting for the timer.
        harness
            .mm
            .set_external_pages(harness.mm.free_physical_pages() - 5);
        harness.mm.raise_physical_warning();

        assert!(harness.wait_until(Duration::from_secs(5), || {
            harness.cache.physical_page_count() < 20
        }));
    }

    #[test]
    fn test_pressure_cycle_evicts_then_flushes() {
        let harness = Harness::small_with_tunables(quick_tunables());
        let file = harness.file(0x40000);

        // Clean inventory above the low-memory minimum plus two spread
        // dirty runs, then physical pressure: the flush yields to
        // eviction once, and the cycle loops back and finishes.
        for index in 0..10u64 {
            let entry = harness.insert_page(&file, 0x10000 + index * 0x1000, 0x42);
            harness.cache.release(&entry);
        }
        for offset in [0u64, 0x8000] {
            let entry = harness.insert_dirty_page(&file, offset, 0x24);
            harness.cache.release(&entry);
        }

        harness
            .mm
            .set_external_pages(harness.mm.free_physical_pages() - 5);

        harness.cache.run_worker_cycle();

        // Everything dirty made it out and the cache shrank.
        assert_eq!(harness.cache.dirty_page_count(), 0);
        let data = harness.store.read(file.id(), 0x8000, 0x1000);
        assert!(data.iter().all(|&b| b == 0x24));
        assert!(harness.cache.physical_page_count() < 12);
    }

    #[test]
    fn test_shutdown_on_drop() {
        let harness = Harness::with_tunables(quick_tunables());
        harness.cache.start().unwrap();
        let cache = Arc::clone(&harness.cache);
        drop(harness);
        // The remaining reference tears the worker down without hanging.
        drop(cache);
    }
}
