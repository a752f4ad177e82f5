//! Heap Module - topology and object enumeration
//!
//! [`HeapTopology`] is established once per session; [`ObjectIterator`]
//! walks it lazily.

pub mod topology;
pub mod walker;

pub use topology::{HeapInfo, HeapTopology, Segment, SegmentKind, SegmentLocation};
pub use walker::{NearObjects, ObjectIterator};
