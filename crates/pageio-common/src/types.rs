//! Core type definitions for PageIO
//!
//! This module defines the fundamental types used throughout the system:
//! object identifiers, object types, and physical/virtual page addresses.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a file-like object
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a new random object ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of file-like object a cache entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// A regular file on a mounted volume
    RegularFile,
    /// A symbolic link
    SymbolicLink,
    /// A shared memory object
    SharedMemory,
    /// A block device (disk or partition)
    BlockDevice,
    /// A character device (never cached)
    CharacterDevice,
    /// A socket (never cached)
    Socket,
}

impl ObjectType {
    /// Whether entries of this type may share a physical page with an entry
    /// of another type
    #[must_use]
    pub fn is_linkable(self) -> bool {
        matches!(
            self,
            Self::RegularFile | Self::SymbolicLink | Self::SharedMemory | Self::BlockDevice
        )
    }

    /// Whether objects of this type participate in the page cache at all
    #[must_use]
    pub fn is_cacheable(self) -> bool {
        self.is_linkable()
    }

    /// Whether this is a cacheable file-level type (linkable, sits above a
    /// block device)
    #[must_use]
    pub fn is_cacheable_file(self) -> bool {
        self.is_linkable() && self != Self::BlockDevice
    }
}

/// Physical address of a page frame
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wrap a raw physical address
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw address value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether the address is aligned to the given page size
    #[must_use]
    pub const fn is_aligned(self, page_size: u64) -> bool {
        self.0 % page_size == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Virtual address of a mapped page
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Wrap a raw virtual address
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw address value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The address one region of `bytes` past this one
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Whether the address is aligned to the given page size
    #[must_use]
    pub const fn is_aligned(self, page_size: u64) -> bool {
        self.0 % page_size == 0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Round a value down to the given alignment
#[must_use]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value - (value % alignment)
}

/// Round a value up to the given alignment
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let rem = value % alignment;
    if rem == 0 {
        value
    } else {
        value + (alignment - rem)
    }
}

/// Whether a value is a multiple of the given alignment
#[must_use]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value % alignment == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_linkable() {
        assert!(ObjectType::RegularFile.is_linkable());
        assert!(ObjectType::SymbolicLink.is_linkable());
        assert!(ObjectType::SharedMemory.is_linkable());
        assert!(ObjectType::BlockDevice.is_linkable());
        assert!(!ObjectType::CharacterDevice.is_linkable());
        assert!(!ObjectType::Socket.is_linkable());
    }

    #[test]
    fn test_object_type_cacheable_file() {
        assert!(ObjectType::RegularFile.is_cacheable_file());
        assert!(!ObjectType::BlockDevice.is_cacheable_file());
        assert!(!ObjectType::Socket.is_cacheable_file());
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(0x1234, 0x1000), 0x1000);
        assert_eq!(align_down(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1234, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert!(is_aligned(0x3000, 0x1000));
        assert!(!is_aligned(0x3001, 0x1000));
    }

    #[test]
    fn test_addr_display() {
        let pa = PhysAddr::new(0x5000);
        assert_eq!(format!("{pa}"), "0x5000");
        assert!(pa.is_aligned(0x1000));
        assert!(!PhysAddr::new(0x5010).is_aligned(0x1000));
    }

    #[test]
    fn test_object_id_roundtrip() {
        let id = ObjectId::new();
        assert_eq!(id, ObjectId::from_uuid(id.as_uuid()));
        assert_ne!(id, ObjectId::new());
    }
}
