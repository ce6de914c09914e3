//! Cache entry records
//!
//! A [`CacheEntry`] describes exactly one page-sized slice of one file-like
//! object: where the data lives physically, whether it is mapped, whether it
//! differs from the backing store, and which list it currently sits on. An
//! entry may borrow its physical page from a *backing entry* at the
//! block-device level instead of owning one itself.

use crate::object::FileObject;
use pageio_common::{PhysAddr, VirtAddr};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// The entry's contents differ from the backing store.
pub const FLAG_DIRTY: u32 = 0x0000_0001;

/// The entry owns the physical page it uses.
pub const FLAG_OWNER: u32 = 0x0000_0002;

/// The entry is counted in the global mapped-page count. This is a flag
/// rather than a check of the virtual address so it can be managed
/// atomically together with the dirty flag, keeping the mapped-dirty count
/// correct. It is never set on non-owners.
pub const FLAG_MAPPED: u32 = 0x0000_0004;

/// Sanity ceiling on the reference count.
pub(crate) const MAX_REFERENCES: u32 = 0x1000;

/// Which container an entry's list hook currently points into. `None` is a
/// distinct state: it is the admission gate for the reinsert done by the
/// last reference release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum HookTag {
    /// Not on any list
    None = 0,
    /// Global clean LRU
    CleanLru = 1,
    /// Global clean-but-unmapped list
    CleanUnmapped = 2,
    /// Global pending-removal list
    Removal = 3,
    /// The owning object's dirty list
    Dirty = 4,
    /// A caller-local list (drained for flushing or destruction)
    Local = 5,
}

impl HookTag {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::CleanLru,
            2 => Self::CleanUnmapped,
            3 => Self::Removal,
            4 => Self::Dirty,
            5 => Self::Local,
            _ => Self::None,
        }
    }
}

/// One cached page of one file-like object.
pub struct CacheEntry {
    /// The object this page belongs to. Holding an entry keeps the object
    /// alive.
    object: Arc<FileObject>,
    /// Page-aligned offset of the cached page within the object
    offset: u64,
    /// Physical address of the page holding the data. Mutated only by
    /// link, which holds the object lock exclusively.
    physical: AtomicU64,
    /// Virtual address of the page, zero when unmapped. On non-owners this
    /// is a cache of the backing entry's address.
    virtual_cell: AtomicU64,
    /// The entry that owns the physical page this entry borrows
    backing: Mutex<Option<Arc<CacheEntry>>>,
    /// Number of outstanding references
    references: AtomicU32,
    /// FLAG_* bits
    flags: AtomicU32,
    /// Which list the entry is on; protected by the global list lock
    hook_tag: AtomicU8,
    /// Position key within the list named by the tag
    hook_key: AtomicU64,
    /// Whether the entry is still present in its object's index. Cleared
    /// on removal, which is final.
    in_index: AtomicBool,
}

impl CacheEntry {
    /// Create a fresh record. Entries are born with one reference, no
    /// flags, and off all lists; the owner flag and counters are assigned
    /// at insertion.
    pub(crate) fn new(
        object: Arc<FileObject>,
        virtual_addr: Option<VirtAddr>,
        physical: PhysAddr,
        offset: u64,
    ) -> Self {
        Self {
            object,
            offset,
            physical: AtomicU64::new(physical.raw()),
            virtual_cell: AtomicU64::new(virtual_addr.map_or(0, VirtAddr::raw)),
            backing: Mutex::new(None),
            references: AtomicU32::new(1),
            flags: AtomicU32::new(0),
            hook_tag: AtomicU8::new(HookTag::None as u8),
            hook_key: AtomicU64::new(0),
            in_index: AtomicBool::new(false),
        }
    }

    /// The object this entry belongs to
    pub fn object(&self) -> &Arc<FileObject> {
        &self.object
    }

    /// Offset of the cached page within its object
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Physical address of the page holding the data
    pub fn physical(&self) -> PhysAddr {
        PhysAddr::new(self.physical.load(Ordering::SeqCst))
    }

    pub(crate) fn set_physical(&self, physical: PhysAddr) {
        self.physical.store(physical.raw(), Ordering::SeqCst);
    }

    /// The entry's virtual address, if mapped. When the entry borrows a
    /// mapped backing entry, the address is pulled over from there; racing
    /// callers all write the same value, which is benign.
    pub fn virtual_address(&self) -> Option<VirtAddr> {
        let cached = self.virtual_cell.load(Ordering::SeqCst);
        if cached != 0 {
            return Some(VirtAddr::new(cached));
        }

        let backing = self.backing.lock().clone();
        if let Some(backing) = backing {
            debug_assert!(!self.is_owner());
            let raw = backing.virtual_cell.load(Ordering::SeqCst);
            if raw != 0 {
                self.virtual_cell.store(raw, Ordering::SeqCst);
                return Some(VirtAddr::new(raw));
            }
        }

        None
    }

    /// The entry's own virtual-address field, without consulting the
    /// backing entry.
    pub(crate) fn cached_virtual(&self) -> Option<VirtAddr> {
        let raw = self.virtual_cell.load(Ordering::SeqCst);
        (raw != 0).then(|| VirtAddr::new(raw))
    }

    pub(crate) fn store_virtual(&self, virtual_addr: Option<VirtAddr>) {
        self.virtual_cell
            .store(virtual_addr.map_or(0, VirtAddr::raw), Ordering::SeqCst);
    }

    /// Current FLAG_* bits
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::SeqCst)
    }

    /// Whether the cached bytes differ from the backing store
    pub fn is_dirty(&self) -> bool {
        self.flags() & FLAG_DIRTY != 0
    }

    /// Whether this entry owns its physical page
    pub fn is_owner(&self) -> bool {
        self.flags() & FLAG_OWNER != 0
    }

    /// Whether this entry is counted in the global mapped-page count
    pub fn is_mapped(&self) -> bool {
        self.flags() & FLAG_MAPPED != 0
    }

    /// Atomically set flag bits, returning the previous flags
    pub(crate) fn set_flags(&self, mask: u32) -> u32 {
        self.flags.fetch_or(mask, Ordering::SeqCst)
    }

    /// Atomically clear flag bits, returning the previous flags
    pub(crate) fn clear_flags(&self, mask: u32) -> u32 {
        self.flags.fetch_and(!mask, Ordering::SeqCst)
    }

    /// Number of outstanding references
    pub fn references(&self) -> u32 {
        self.references.load(Ordering::SeqCst)
    }

    /// Increment the reference count. Callers must already hold a
    /// reference or the owning object's lock.
    pub(crate) fn add_reference(&self) {
        let old = self.references.fetch_add(1, Ordering::SeqCst);
        debug_assert!(old < MAX_REFERENCES);
    }

    /// Decrement the reference count, returning the previous value. The
    /// clean-LRU reinsert that may follow lives on the cache, which owns
    /// the list lock.
    pub(crate) fn drop_reference(&self) -> u32 {
        let old = self.references.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old != 0 && old < MAX_REFERENCES);
        old
    }

    /// The entry owning the physical page this entry borrows, if any
    pub fn backing(&self) -> Option<Arc<CacheEntry>> {
        self.backing.lock().clone()
    }

    pub(crate) fn set_backing(&self, backing: Arc<CacheEntry>) {
        let mut slot = self.backing.lock();
        debug_assert!(slot.is_none());
        *slot = Some(backing);
    }

    pub(crate) fn take_backing(&self) -> Option<Arc<CacheEntry>> {
        self.backing.lock().take()
    }

    /// Whether the entry is still reachable through its object's index
    pub fn in_index(&self) -> bool {
        self.in_index.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_index(&self, present: bool) {
        self.in_index.store(present, Ordering::SeqCst);
    }

    pub(crate) fn hook(&self) -> (HookTag, u64) {
        (
            HookTag::from_u8(self.hook_tag.load(Ordering::SeqCst)),
            self.hook_key.load(Ordering::SeqCst),
        )
    }

    pub(crate) fn hook_tag(&self) -> HookTag {
        HookTag::from_u8(self.hook_tag.load(Ordering::SeqCst))
    }

    /// Update the list hook. Must only be called with the global list lock
    /// held.
    pub(crate) fn set_hook(&self, tag: HookTag, key: u64) {
        self.hook_tag.store(tag as u8, Ordering::SeqCst);
        self.hook_key.store(key, Ordering::SeqCst);
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("object", &self.object.id())
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("physical", &self.physical())
            .field("references", &self.references())
            .field("flags", &format_args!("{:#x}", self.flags()))
            .field("in_index", &self.in_index())
            .finish()
    }
}
