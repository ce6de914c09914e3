//! Cache tunables and derived sizing limits

use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Tunable knobs for the page cache. The defaults match the values the
/// cache has always shipped with; deployments may override individual
/// fields before constructing the cache.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Free-page percentage of RAM at (or below) which the cache starts
    /// evicting entries
    pub headroom_trigger_percent: u64,
    /// Free-page percentage of RAM eviction shoots for once it kicks in
    pub headroom_retreat_percent: u64,
    /// Cache size in percent of RAM below which pageout of user pages is
    /// requested instead of further shrinking
    pub minimum_target_percent: u64,
    /// Cache size in percent of RAM the cache is entitled to even when
    /// memory is tight
    pub minimum_percent: u64,
    /// Free virtual memory below which unmapping starts, on systems with a
    /// small (< 4 GiB) kernel virtual space
    pub small_virtual_trigger_bytes: u64,
    /// Free virtual memory unmapping shoots for, small virtual space
    pub small_virtual_retreat_bytes: u64,
    /// Free virtual memory below which unmapping starts, large virtual space
    pub large_virtual_trigger_bytes: u64,
    /// Free virtual memory unmapping shoots for, large virtual space
    pub large_virtual_retreat_bytes: u64,
    /// Capacity of the coalesced flush buffer
    pub flush_max_bytes: u64,
    /// Maximum streak of clean pages tolerated inside a dirty run before
    /// the write is broken up
    pub max_clean_streak: u64,
    /// Delay between a write dirtying the cache and the worker cleaning it.
    /// This lets writes pool.
    pub clean_delay: Duration,
    /// Percentage of RAM that must be clean in a low-memory situation
    /// before flushing yields to eviction
    pub low_memory_clean_percent: u64,
    /// Hard cap on the low-memory clean page minimum
    pub low_memory_clean_maximum_pages: u64,
    /// Portion of the ideal cache size allowed to be dirty, as a shift
    /// (1 means at most half)
    pub max_dirty_shift: u32,
    /// Disable storing virtual addresses in cache entries entirely
    pub disable_virtual_addresses: bool,
    /// Optional budget on the number of live entry records; `None` leaves
    /// the allocator unbounded
    pub entry_limit: Option<usize>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            headroom_trigger_percent: 10,
            headroom_retreat_percent: 15,
            minimum_target_percent: 33,
            minimum_percent: 7,
            small_virtual_trigger_bytes: 512 * MIB,
            small_virtual_retreat_bytes: 896 * MIB,
            large_virtual_trigger_bytes: GIB,
            large_virtual_retreat_bytes: 3 * GIB,
            flush_max_bytes: 128 * 1024,
            max_clean_streak: 4,
            clean_delay: Duration::from_secs(5),
            low_memory_clean_percent: 10,
            low_memory_clean_maximum_pages: 256,
            max_dirty_shift: 1,
            disable_virtual_addresses: false,
            entry_limit: None,
        }
    }
}

/// Page-count limits computed once at construction from the memory
/// manager's totals.
#[derive(Debug, Clone)]
pub(crate) struct Limits {
    /// Free physical pages at or below which eviction starts
    pub headroom_pages_trigger: u64,
    /// Free physical pages eviction shoots for
    pub headroom_pages_retreat: u64,
    /// Cache size below which pageout is requested
    pub minimum_pages_target: u64,
    /// Cache size the cache will not shrink below
    pub minimum_pages: u64,
    /// Clean pages required before flushing yields to eviction under
    /// pressure
    pub low_memory_clean_page_minimum: u64,
    /// Free virtual pages at or below which unmapping starts
    pub virtual_pages_trigger: u64,
    /// Free virtual pages unmapping shoots for
    pub virtual_pages_retreat: u64,
}

/// Virtual address spaces smaller than this use the small-system thresholds.
const SMALL_VIRTUAL_SPACE_BYTES: u64 = 4 * GIB;

impl Limits {
    pub(crate) fn compute(
        tunables: &Tunables,
        total_physical_pages: u64,
        total_virtual_bytes: u64,
        page_size: u64,
    ) -> Self {
        let percent = |p: u64| total_physical_pages * p / 100;
        let mut low_memory_clean_page_minimum = percent(tunables.low_memory_clean_percent);
        if low_memory_clean_page_minimum > tunables.low_memory_clean_maximum_pages {
            low_memory_clean_page_minimum = tunables.low_memory_clean_maximum_pages;
        }

        let (virtual_trigger_bytes, virtual_retreat_bytes) =
            if total_virtual_bytes < SMALL_VIRTUAL_SPACE_BYTES {
                (
                    tunables.small_virtual_trigger_bytes,
                    tunables.small_virtual_retreat_bytes,
                )
            } else {
                (
                    tunables.large_virtual_trigger_bytes,
                    tunables.large_virtual_retreat_bytes,
                )
            };

        Self {
            headroom_pages_trigger: percent(tunables.headroom_trigger_percent),
            headroom_pages_retreat: percent(tunables.headroom_retreat_percent),
            minimum_pages_target: percent(tunables.minimum_target_percent),
            minimum_pages: percent(tunables.minimum_percent),
            low_memory_clean_page_minimum,
            virtual_pages_trigger: virtual_trigger_bytes / page_size,
            virtual_pages_retreat: virtual_retreat_bytes / page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunables() {
        let t = Tunables::default();
        assert_eq!(t.headroom_trigger_percent, 10);
        assert_eq!(t.headroom_retreat_percent, 15);
        assert_eq!(t.flush_max_bytes, 128 * 1024);
        assert_eq!(t.max_clean_streak, 4);
        assert_eq!(t.clean_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_limits_small_system() {
        // 1 GiB of RAM, 2 GiB of virtual space, 4 KiB pages.
        let limits = Limits::compute(&Tunables::default(), 262_144, 2 * GIB, 4096);
        assert_eq!(limits.headroom_pages_trigger, 26_214);
        assert_eq!(limits.headroom_pages_retreat, 39_321);
        assert_eq!(limits.minimum_pages_target, 86_507);
        assert_eq!(limits.minimum_pages, 18_350);
        // 10% of RAM is far above the 256-page cap.
        assert_eq!(limits.low_memory_clean_page_minimum, 256);
        // Small virtual space thresholds.
        assert_eq!(limits.virtual_pages_trigger, 512 * MIB / 4096);
        assert_eq!(limits.virtual_pages_retreat, 896 * MIB / 4096);
    }

    #[test]
    fn test_limits_large_system() {
        let limits = Limits::compute(&Tunables::default(), 262_144, 128 * GIB, 4096);
        assert_eq!(limits.virtual_pages_trigger, GIB / 4096);
        assert_eq!(limits.virtual_pages_retreat, 3 * GIB / 4096);
    }

    #[test]
    fn test_limits_clean_minimum_uncapped() {
        // Tiny system: 10% of 1024 pages stays below the 256-page cap.
        let limits = Limits::compute(&Tunables::default(), 1024, 2 * GIB, 4096);
        assert_eq!(limits.low_memory_clean_page_minimum, 102);
    }
}
