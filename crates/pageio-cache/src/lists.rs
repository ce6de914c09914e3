//! Process-wide entry lists
//!
//! One lock guards every list an entry can sit on: the clean LRU, the
//! clean-unmapped side pocket, the pending-removal list, and each object's
//! dirty list. An entry's hook names the list it is currently on; `None`
//! is the distinct off-list state that gates the reinsert performed by the
//! last reference release.
//!
//! LRU order is kept with a monotonically increasing sequence key: pushing
//! at the tail assigns the next key, so the smallest key is always the
//! least recently used entry.

use crate::entry::{CacheEntry, HookTag};
use pageio_common::ObjectId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The three global lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlobalListKind {
    /// Clean entries in least-to-most recently used order
    CleanLru,
    /// Clean entries already stripped of their virtual address
    CleanUnmapped,
    /// Entries removed from their index, awaiting destruction
    Removal,
}

impl GlobalListKind {
    fn tag(self) -> HookTag {
        match self {
            Self::CleanLru => HookTag::CleanLru,
            Self::CleanUnmapped => HookTag::CleanUnmapped,
            Self::Removal => HookTag::Removal,
        }
    }
}

/// All list state, kept behind the cache's single list lock.
#[derive(Default)]
pub(crate) struct GlobalLists {
    clean: BTreeMap<u64, Arc<CacheEntry>>,
    clean_unmapped: BTreeMap<u64, Arc<CacheEntry>>,
    removal: BTreeMap<u64, Arc<CacheEntry>>,
    /// Per-object dirty lists, keyed by page offset within the object
    dirty: HashMap<ObjectId, BTreeMap<u64, Arc<CacheEntry>>>,
    /// Next LRU sequence key
    next_key: u64,
}

impl GlobalLists {
    fn list_mut(&mut self, kind: GlobalListKind) -> &mut BTreeMap<u64, Arc<CacheEntry>> {
        match kind {
            GlobalListKind::CleanLru => &mut self.clean,
            GlobalListKind::CleanUnmapped => &mut self.clean_unmapped,
            GlobalListKind::Removal => &mut self.removal,
        }
    }

    /// Push an off-list entry at the tail of a global list.
    pub(crate) fn push_tail(&mut self, kind: GlobalListKind, entry: &Arc<CacheEntry>) {
        debug_assert_eq!(entry.hook_tag(), HookTag::None);
        let key = self.next_key;
        self.next_key += 1;
        entry.set_hook(kind.tag(), key);
        self.list_mut(kind).insert(key, Arc::clone(entry));
    }

    /// Remove an entry from whichever list its hook names. Tolerates
    /// entries that are off-list or held in a caller-local container;
    /// returns whether a global list actually changed.
    pub(crate) fn remove(&mut self, entry: &Arc<CacheEntry>) -> bool {
        let (tag, key) = entry.hook();
        let removed = match tag {
            HookTag::None | HookTag::Local => false,
            HookTag::CleanLru => self.clean.remove(&key).is_some(),
            HookTag::CleanUnmapped => self.clean_unmapped.remove(&key).is_some(),
            HookTag::Removal => self.removal.remove(&key).is_some(),
            HookTag::Dirty => {
                let object_id = entry.object().id();
                let mut emptied = false;
                let removed = if let Some(list) = self.dirty.get_mut(&object_id) {
                    let removed = list.remove(&key).is_some();
                    emptied = list.is_empty();
                    removed
                } else {
                    false
                };
                if emptied {
                    self.dirty.remove(&object_id);
                }
                removed
            }
        };

        entry.set_hook(HookTag::None, 0);
        removed
    }

    /// Remove from the current list (if any) and push at the clean tail.
    pub(crate) fn move_to_clean_tail(&mut self, entry: &Arc<CacheEntry>) {
        self.remove(entry);
        self.push_tail(GlobalListKind::CleanLru, entry);
    }

    /// Append an off-list entry to its object's dirty list.
    pub(crate) fn push_dirty(&mut self, entry: &Arc<CacheEntry>) {
        debug_assert_eq!(entry.hook_tag(), HookTag::None);
        let object_id = entry.object().id();
        let offset = entry.offset();
        entry.set_hook(HookTag::Dirty, offset);
        self.dirty
            .entry(object_id)
            .or_default()
            .insert(offset, Arc::clone(entry));
    }

    /// Whether an object's dirty list is empty.
    pub(crate) fn dirty_is_empty(&self, object_id: ObjectId) -> bool {
        self.dirty
            .get(&object_id)
            .map_or(true, |list| list.is_empty())
    }

    /// Drain an object's dirty list into a caller-local container. Drained
    /// entries are tagged `Local`; the drainer must verify the tag is
    /// still `Local` before acting on a drained entry.
    pub(crate) fn take_dirty(&mut self, object_id: ObjectId) -> BTreeMap<u64, Arc<CacheEntry>> {
        let list = self.dirty.remove(&object_id).unwrap_or_default();
        for entry in list.values() {
            entry.set_hook(HookTag::Local, 0);
        }
        list
    }

    /// Put drained dirty entries back. Entries that were re-homed while
    /// drained (marked clean, re-dirtied, or evicted) are skipped.
    pub(crate) fn restore_dirty(
        &mut self,
        object_id: ObjectId,
        leftover: BTreeMap<u64, Arc<CacheEntry>>,
    ) {
        for (offset, entry) in leftover {
            if entry.hook_tag() != HookTag::Local {
                continue;
            }
            if entry.is_dirty() && entry.in_index() {
                entry.set_hook(HookTag::Dirty, offset);
                self.dirty
                    .entry(object_id)
                    .or_default()
                    .insert(offset, entry);
            } else {
                entry.set_hook(HookTag::None, 0);
            }
        }
    }

    /// Drain an entire global list into a caller-local container, tagging
    /// the entries `Local`.
    pub(crate) fn take_list(&mut self, kind: GlobalListKind) -> BTreeMap<u64, Arc<CacheEntry>> {
        let list = std::mem::take(self.list_mut(kind));
        for entry in list.values() {
            entry.set_hook(HookTag::Local, 0);
        }
        list
    }

    /// Append drained entries back onto a global list, preserving their
    /// relative order. Entries re-homed while drained are skipped.
    pub(crate) fn append_list(
        &mut self,
        kind: GlobalListKind,
        leftover: BTreeMap<u64, Arc<CacheEntry>>,
    ) {
        for entry in leftover.values() {
            if entry.hook_tag() != HookTag::Local {
                continue;
            }
            entry.set_hook(HookTag::None, 0);
            self.push_tail(kind, entry);
        }
    }

    /// Least recently used entry of a global list, without removing it.
    pub(crate) fn peek_front(&self, kind: GlobalListKind) -> Option<Arc<CacheEntry>> {
        let list = match kind {
            GlobalListKind::CleanLru => &self.clean,
            GlobalListKind::CleanUnmapped => &self.clean_unmapped,
            GlobalListKind::Removal => &self.removal,
        };
        list.first_key_value().map(|(_, entry)| Arc::clone(entry))
    }

    pub(crate) fn len(&self, kind: GlobalListKind) -> usize {
        match kind {
            GlobalListKind::CleanLru => self.clean.len(),
            GlobalListKind::CleanUnmapped => self.clean_unmapped.len(),
            GlobalListKind::Removal => self.removal.len(),
        }
    }

    /// Whether an entry at (object, offset) is on its object's dirty list.
    pub(crate) fn dirty_contains(&self, object_id: ObjectId, offset: u64) -> bool {
        self.dirty
            .get(&object_id)
            .map_or(false, |list| list.contains_key(&offset))
    }
}
