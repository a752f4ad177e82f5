//! Typed-index vector used as a query-scoped arena
//!
//! Search nodes refer to their parents by index rather than by pointer; the
//! whole arena is dropped (or cleared) when the query ends.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// Index type for [`IndexVec`]
pub trait Idx: Copy + Eq {
    fn from_usize(idx: usize) -> Self;

    fn index(self) -> usize;
}

/// A vector indexed by a specific type
///
/// # Example
///
/// ```
/// use heapscope::define_idx;
/// use heapscope::util::IndexVec;
///
/// define_idx!(NodeId);
///
/// let mut nodes: IndexVec<NodeId, u64> = IndexVec::new();
/// let root = nodes.push(0x1000);
/// let child = nodes.push(0x2000);
///
/// assert_eq!(nodes[root], 0x1000);
/// assert_eq!(nodes[child], 0x2000);
/// ```
#[derive(Clone, Debug)]
pub struct IndexVec<I, T> {
    raw: Vec<T>,
    _marker: PhantomData<fn(&I)>,
}

impl<I: Idx, T> IndexVec<I, T> {
    #[inline]
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Append an element and return its index
    #[inline]
    pub fn push(&mut self, value: T) -> I {
        let idx = I::from_usize(self.raw.len());
        self.raw.push(value);
        idx
    }

    /// Reserve room for `additional` more elements without aborting on failure
    pub fn try_reserve(
        &mut self,
        additional: usize,
    ) -> Result<(), std::collections::TryReserveError> {
        self.raw.try_reserve(additional)
    }

    #[inline]
    pub fn get(&self, idx: I) -> Option<&T> {
        self.raw.get(idx.index())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Drop every element, keeping the allocation
    pub fn clear(&mut self) {
        self.raw.clear();
    }
}

impl<I: Idx, T> Default for IndexVec<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Idx, T> Index<I> for IndexVec<I, T> {
    type Output = T;

    #[inline]
    fn index(&self, idx: I) -> &T {
        &self.raw[idx.index()]
    }
}

impl<I: Idx, T> IndexMut<I> for IndexVec<I, T> {
    #[inline]
    fn index_mut(&mut self, idx: I) -> &mut T {
        &mut self.raw[idx.index()]
    }
}

/// Define a `u32` newtype implementing [`Idx`]
#[macro_export]
macro_rules! define_idx {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $crate::util::index_vec::Idx for $name {
            fn from_usize(idx: usize) -> Self {
                assert!(idx <= u32::MAX as usize, "Index {} exceeds u32::MAX", idx);
                $name(idx as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}
