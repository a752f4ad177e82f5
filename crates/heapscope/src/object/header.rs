//! Object Header - how a target object is laid out
//!
//! Object layout in the target (P = pointer size):
//! ┌─────────────────────────────────────────┐
//! │   Type handle (P bytes)                 │  <- object address
//! │  - Bits 0-1: GC mark bits               │
//! │  - Bits 2..: MethodTable address        │
//! ├─────────────────────────────────────────┤
//! │   Component count (u32, arrays/strings) │  <- address + P
//! ├─────────────────────────────────────────┤
//! │   Fields / elements ...                 │
//! └─────────────────────────────────────────┘
//!
//! The object header word lives at `address - P` and is never read here.
//!
//! Object size = `BaseSize + ComponentSize * count`, plus one extra component
//! for strings (terminator), padded to the minimum object size and rounded to
//! the segment's alignment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Low bits of a raw type-handle word used by the GC for marking
pub const TYPE_HANDLE_MARK_BITS: u64 = 0b11;

/// Address of a type's MethodTable, with the GC mark bits removed
///
/// The only constructor masks the mark bits, so a `TypeHandle` is always
/// usable as an address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct TypeHandle(u64);

impl TypeHandle {
    /// Build from a raw word read out of an object
    ///
    /// # Examples
    /// ```
    /// use heapscope::TypeHandle;
    ///
    /// let th = TypeHandle::new(0x7ff0_1003);
    /// assert_eq!(th.address(), 0x7ff0_1000);
    /// ```
    #[inline]
    pub const fn new(raw: u64) -> Self {
        TypeHandle(raw & !TYPE_HANDLE_MARK_BITS)
    }

    #[inline]
    pub const fn address(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for TypeHandle {
    fn from(raw: u64) -> Self {
        TypeHandle::new(raw)
    }
}

impl From<TypeHandle> for u64 {
    fn from(th: TypeHandle) -> Self {
        th.0
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeHandle({:#x})", self.0)
    }
}

impl fmt::Display for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One object produced by the heap walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObject {
    pub address: u64,
    pub type_handle: TypeHandle,
    /// Aligned size in bytes
    pub size: u64,
    pub contains_pointers: bool,
    pub collectible: bool,
    /// Free-space filler rather than a live allocation
    pub is_free: bool,
    /// Owning heap index
    pub heap: usize,
    /// Index into [`HeapTopology::segments`](crate::heap::HeapTopology::segments)
    pub segment: usize,
}

impl HeapObject {
    /// First address past this object
    #[inline]
    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    /// Whether the reference decoder has anything to yield
    #[inline]
    pub fn has_references(&self) -> bool {
        self.contains_pointers || self.collectible
    }
}
