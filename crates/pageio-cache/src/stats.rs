//! Statistics and debug probes

use crate::cache::PageCache;
use crate::object::FileObject;
use pageio_common::{CacheError, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

/// Version of the statistics structure this build fills in.
pub const CACHE_STATISTICS_VERSION: u32 = 1;

/// A read-only snapshot of the cache's state. Zero the structure and set
/// `version` to [`CACHE_STATISTICS_VERSION`] before asking for it; fields
/// added by newer builds would otherwise come back uninitialized to older
/// callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Structure version supplied by the caller
    pub version: u32,
    /// Entries resident in any object's index
    pub entry_count: u64,
    /// Free-page line at which eviction starts
    pub headroom_pages_trigger: u64,
    /// Free-page line eviction shoots for
    pub headroom_pages_retreat: u64,
    /// Cache size below which pageout is requested
    pub minimum_pages_target: u64,
    /// Physical pages owned by the cache
    pub physical_page_count: u64,
    /// Dirty pages in the cache
    pub dirty_page_count: u64,
    /// Cache pages counted as mapped
    pub mapped_page_count: u64,
    /// Microseconds (since cache construction) of the last cleaning
    /// attempt
    pub last_clean_time_us: u64,
}

impl CacheStatistics {
    /// A zeroed snapshot carrying the current version.
    #[must_use]
    pub fn request() -> Self {
        Self {
            version: CACHE_STATISTICS_VERSION,
            ..Self::default()
        }
    }
}

impl PageCache {
    /// Fill in cache statistics. Fails with `UnsupportedVersion` when the
    /// caller's structure predates this build.
    pub fn statistics(&self, out: &mut CacheStatistics) -> Result<()> {
        if out.version < CACHE_STATISTICS_VERSION {
            return Err(CacheError::UnsupportedVersion {
                given: out.version,
                required: CACHE_STATISTICS_VERSION,
            });
        }

        out.entry_count = self.resident_entries();
        out.headroom_pages_trigger = self.limits.headroom_pages_trigger;
        out.headroom_pages_retreat = self.limits.headroom_pages_retreat;
        out.minimum_pages_target = self.limits.minimum_pages_target;
        out.physical_page_count = self.physical_page_count();
        out.dirty_page_count = self.dirty_page_count();
        out.mapped_page_count = self.mapped_page_count();
        out.last_clean_time_us = self.last_clean_us.load(Ordering::SeqCst);
        Ok(())
    }

    /// Consistency probe: every dirty entry of the object must sit on the
    /// object's dirty list. Very slow; only worth running when chasing
    /// lost dirty pages.
    pub fn verify_dirty_list(&self, object: &Arc<FileObject>) -> bool {
        let pages = object.pages().read();
        let lists = self.lists.lock();
        let mut consistent = true;
        for entry in pages.iter() {
            if entry.is_dirty() && !lists.dirty_contains(object.id(), entry.offset()) {
                warn!(
                    object = %object.id(),
                    offset = format_args!("{:#x}", entry.offset()),
                    "dirty entry not on the dirty list"
                );
                consistent = false;
            }
        }

        consistent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[test]
    fn test_statistics_snapshot() {
        let harness = Harness::new();
        let file = harness.file(0x4000);
        let entry = harness.insert_dirty_page(&file, 0, 0x31);

        let mut stats = CacheStatistics::request();
        harness.cache.statistics(&mut stats).unwrap();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.physical_page_count, 1);
        assert_eq!(stats.dirty_page_count, 1);
        assert_eq!(stats.headroom_pages_trigger, 102);
        assert_eq!(stats.headroom_pages_retreat, 153);
        assert_eq!(stats.minimum_pages_target, 337);

        harness.cache.mark_clean(&entry, true);
        harness.cache.release(&entry);
    }

    #[test]
    fn test_statistics_rejects_old_version() {
        let harness = Harness::new();
        let mut stats = CacheStatistics {
            version: 0,
            ..CacheStatistics::default()
        };
        let error = harness.cache.statistics(&mut stats).unwrap_err();
        assert!(matches!(error, CacheError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_last_clean_time_advances() {
        let harness = Harness::new();
        let mut stats = CacheStatistics::request();
        harness.cache.statistics(&mut stats).unwrap();
        assert_eq!(stats.last_clean_time_us, 0);

        std::thread::sleep(std::time::Duration::from_millis(2));
        harness.cache.run_worker_cycle();
        harness.cache.statistics(&mut stats).unwrap();
        assert!(stats.last_clean_time_us > 0);
    }

    #[test]
    fn test_verify_dirty_list() {
        let harness = Harness::new();
        let file = harness.file(0x4000);
        let entry = harness.insert_dirty_page(&file, 0, 0x01);
        assert!(harness.cache.verify_dirty_list(&file));

        // Rip the entry out of the dirty list behind the tracker's back;
        // the probe notices.
        {
            let mut lists = harness.cache.lists.lock();
            lists.remove(&entry);
        }
        assert!(!harness.cache.verify_dirty_list(&file));

        // Repair and re-check.
        {
            let mut lists = harness.cache.lists.lock();
            lists.push_dirty(&entry);
        }
        assert!(harness.cache.verify_dirty_list(&file));

        harness.cache.mark_clean(&entry, true);
        harness.cache.release(&entry);
    }
}
