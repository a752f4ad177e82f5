//! Cache Module - read-through caches over the target
//!
//! - [`LinearReadCache`]: one page of target memory
//! - [`MethodTableCache`]: per-type layout, name and GCDesc
//!
//! Both are owned by a session and invalidated together when the target is
//! resumed and stopped again.

pub mod method_table;
pub mod read_cache;

pub use method_table::{MethodTableCache, MethodTableInfo};
pub use read_cache::LinearReadCache;
