//! File-like objects and their page indices
//!
//! A [`FileObject`] stands in for the device or file whose contents are
//! being cached. It owns the shared-exclusive lock protecting its ordered
//! page index, a size field used to clip flushes, and the dirty-data flag
//! that keeps it on the cache's dirty-object set.

use crate::entry::CacheEntry;
use crate::mm::ImageSectionList;
use pageio_common::{ObjectId, ObjectType};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A file or device participating in the page cache.
pub struct FileObject {
    id: ObjectId,
    object_type: ObjectType,
    /// Current size in bytes; flushes never write past it
    size: AtomicU64,
    /// Set when the object has dirty cached data
    dirty_data: AtomicBool,
    /// The shared-exclusive object lock and the index it protects
    pages: RwLock<ObjectPages>,
    /// Image sections mapping this object, consulted before pages are
    /// reclaimed
    image_sections: Option<Arc<ImageSectionList>>,
}

impl FileObject {
    /// Create a new object of the given type and size.
    pub fn new(object_type: ObjectType, size: u64) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::new(),
            object_type,
            size: AtomicU64::new(size),
            dirty_data: AtomicBool::new(false),
            pages: RwLock::new(ObjectPages::default()),
            image_sections: None,
        })
    }

    /// Create a new object that is mapped by image sections.
    pub fn with_image_sections(
        object_type: ObjectType,
        size: u64,
        sections: Arc<ImageSectionList>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::new(),
            object_type,
            size: AtomicU64::new(size),
            dirty_data: AtomicBool::new(false),
            pages: RwLock::new(ObjectPages::default()),
            image_sections: Some(sections),
        })
    }

    /// Unique identifier of this object
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The kind of object this is
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Update the object's size (truncate or extend)
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    /// Whether the object has dirty cached data
    pub fn has_dirty_data(&self) -> bool {
        self.dirty_data.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dirty_data(&self, dirty: bool) {
        self.dirty_data.store(dirty, Ordering::SeqCst);
    }

    pub(crate) fn pages(&self) -> &RwLock<ObjectPages> {
        &self.pages
    }

    pub(crate) fn image_sections(&self) -> Option<&Arc<ImageSectionList>> {
        self.image_sections.as_ref()
    }
}

impl std::fmt::Debug for FileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileObject")
            .field("id", &self.id)
            .field("type", &self.object_type)
            .field("size", &self.size())
            .field("dirty_data", &self.has_dirty_data())
            .finish()
    }
}

/// The ordered page index of one object: page-aligned offset to cache
/// entry. Offsets are unique; lookups take the object lock shared,
/// mutation takes it exclusive.
#[derive(Default)]
pub(crate) struct ObjectPages {
    entries: BTreeMap<u64, Arc<CacheEntry>>,
}

impl ObjectPages {
    /// Exact-offset lookup
    pub(crate) fn search(&self, offset: u64) -> Option<&Arc<CacheEntry>> {
        self.entries.get(&offset)
    }

    /// Closest entry at or after the given offset
    pub(crate) fn search_closest(&self, offset: u64) -> Option<&Arc<CacheEntry>> {
        self.entries.range(offset..).next().map(|(_, entry)| entry)
    }

    /// In-order successor: the first entry strictly after the given offset
    pub(crate) fn next_after(&self, offset: u64) -> Option<&Arc<CacheEntry>> {
        self.entries
            .range((Bound::Excluded(offset), Bound::Unbounded))
            .next()
            .map(|(_, entry)| entry)
    }

    /// Insert an entry; the caller has verified no collision exists.
    pub(crate) fn insert(&mut self, entry: Arc<CacheEntry>) {
        let previous = self.entries.insert(entry.offset(), entry);
        debug_assert!(previous.is_none());
    }

    /// Remove the entry at the given offset. Removal from the index is
    /// final.
    pub(crate) fn remove(&mut self, offset: u64) -> Option<Arc<CacheEntry>> {
        self.entries.remove(&offset)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Walk all entries in offset order
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<CacheEntry>> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageio_common::PhysAddr;

    fn entry_for(object: &Arc<FileObject>, offset: u64) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(
            Arc::clone(object),
            None,
            PhysAddr::new(0x1000 + offset),
            offset,
        ))
    }

    #[test]
    fn test_index_search() {
        let object = FileObject::new(ObjectType::RegularFile, 0x10000);
        let mut pages = ObjectPages::default();
        for offset in [0x0, 0x1000, 0x4000] {
            pages.insert(entry_for(&object, offset));
        }

        assert_eq!(pages.len(), 3);
        assert!(pages.search(0x1000).is_some());
        assert!(pages.search(0x2000).is_none());
    }

    #[test]
    fn test_search_closest_is_greater_or_equal() {
        let object = FileObject::new(ObjectType::RegularFile, 0x10000);
        let mut pages = ObjectPages::default();
        for offset in [0x1000, 0x4000] {
            pages.insert(entry_for(&object, offset));
        }

        assert_eq!(pages.search_closest(0x0).unwrap().offset(), 0x1000);
        assert_eq!(pages.search_closest(0x1000).unwrap().offset(), 0x1000);
        assert_eq!(pages.search_closest(0x1001).unwrap().offset(), 0x4000);
        assert!(pages.search_closest(0x4001).is_none());
    }

    #[test]
    fn test_next_after_walks_in_order() {
        let object = FileObject::new(ObjectType::RegularFile, 0x10000);
        let mut pages = ObjectPages::default();
        for offset in [0x0, 0x2000, 0x3000] {
            pages.insert(entry_for(&object, offset));
        }

        let mut walked = Vec::new();
        let mut cursor = 0u64;
        walked.push(pages.search_closest(0).unwrap().offset());
        while let Some(next) = pages.next_after(cursor) {
            walked.push(next.offset());
            cursor = next.offset();
        }
        // search_closest(0) returns the entry at 0, then next_after walks
        // the rest.
        assert_eq!(walked, vec![0x0, 0x2000, 0x3000]);
    }

    #[test]
    fn test_remove_is_final() {
        let object = FileObject::new(ObjectType::RegularFile, 0x10000);
        let mut pages = ObjectPages::default();
        pages.insert(entry_for(&object, 0x1000));
        let removed = pages.remove(0x1000).unwrap();
        assert_eq!(removed.offset(), 0x1000);
        assert!(pages.search(0x1000).is_none());
        assert!(pages.is_empty());
    }
}
