//! Object Module - remote object model
//!
//! How an object in the target heap is identified (type handle), sized, and
//! how its outgoing references are decoded from the type's GCDesc.

pub mod gcdesc;
pub mod header;

pub use gcdesc::{
    ObjectReference, ReferenceIterator, ReferenceKind, ReferenceLayout, Series, ValueSeries,
};
pub use header::{HeapObject, TypeHandle, TYPE_HANDLE_MARK_BITS};
