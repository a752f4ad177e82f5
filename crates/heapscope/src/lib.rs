//! # Heapscope - Remote GC Heap Inspection
//!
//! Heapscope reads the managed heap of a *stopped* CLR-style process from
//! the outside. It never runs code in the target: everything comes from two
//! collaborators, raw memory reads and a metadata service describing heaps,
//! segments, types, handles and threads.
//!
//! ## Overview
//!
//! - **Topology**: heaps, their generation and large-object segment chains,
//!   and the allocation contexts that hold no objects yet
//! - **Object Walk**: lazy, ascending enumeration of every object, with
//!   per-segment recovery from corruption
//! - **GCDesc Decoding**: reference slots of any object from the compact
//!   descriptor stored below its MethodTable
//! - **Root Search**: which roots keep an object alive, and through which
//!   objects
//! - **Retention**: bytes kept alive by an object or by each root
//!
//! ## Quick Start
//!
//! ```rust
//! use heapscope::{HeapSession, RootSearchOptions, SessionConfig, SnapshotBuilder};
//!
//! let mut builder = SnapshotBuilder::new();
//! let node = builder.add_type("App.Node", 32, &[8]);
//! let a = builder.alloc(node);
//! let b = builder.alloc(node);
//! builder.set_field(a, 8, b);
//! builder.add_strong_handle(a);
//! let snapshot = builder.build();
//!
//! let session = HeapSession::open(&snapshot, &snapshot, SessionConfig::default())?;
//! let objects = session.objects().collect::<heapscope::Result<Vec<_>>>()?;
//! assert_eq!(objects.len(), 2);
//!
//! let report = session
//!     .root_finder()
//!     .find_roots(b, RootSearchOptions::default())?;
//! assert_eq!(report.paths[0].addresses(), vec![a, b]);
//! # Ok::<(), heapscope::HeapError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Front End (debugger)                   │
//! └───────────────┬──────────────────────────┬───────────────┘
//!                 │                          │
//!        ┌────────▼────────┐        ┌────────▼────────┐
//!        │  ObjectIterator │        │   RootFinder    │
//!        │  list_near_objs │        │  paths, sizes   │
//!        └────────┬────────┘        └────────┬────────┘
//!                 │                          │
//!        ┌────────▼──────────────────────────▼────────┐
//!        │                 HeapSession                 │
//!        │  HeapTopology   MethodTableCache  GCDesc    │
//!        │  LinearReadCache           EventLog         │
//!        └────────┬──────────────────────────┬────────┘
//!                 │                          │
//!        ┌────────▼────────┐        ┌────────▼────────┐
//!        │TargetMemoryReader│       │HeapMetadataService│
//!        └─────────────────┘        └─────────────────┘
//! ```
//!
//! ### Object Layout
//!
//! ```text
//! ┌───────────────┬──────────────┬────────────────────────┐
//! │ TypeHandle    │ count (u32)  │  fields / elements ... │
//! │ (low 2 bits   │ arrays and   │                        │
//! │  are marks)   │ strings only │                        │
//! └───────────────┴──────────────┴────────────────────────┘
//!   size = align(max(base + component * count, 3 * P))
//! ```
//!
//! ## Failure Model
//!
//! Target memory may be unmapped, stale or corrupt. Reads return
//! [`HeapError::DataRead`], implausible structure returns
//! [`HeapError::HeapCorruption`]. Walks yield errors as items; queries keep
//! going and report what they skipped as [`roots::Diagnostic`]s.
//!
//! ### Thread Safety
//!
//! - A [`HeapSession`] is `!Sync`; use one per inspecting thread
//! - [`CancellationToken`] is `Send + Sync` and may be flipped from anywhere

// Session state
pub mod config;
pub mod error;
pub mod session;

// Target access
pub mod cache;
pub mod target;

// Heap model
pub mod heap;
pub mod object;

// Graph queries
pub mod roots;

// Observability
pub mod logging;
pub mod stats;

// Utilities
pub mod util;

pub use config::{ConfigError, SessionConfig};
pub use error::{HeapError, Result};
pub use heap::{HeapTopology, NearObjects, ObjectIterator, Segment, SegmentKind};
pub use logging::{EventLog, EventLogConfig, WalkEvent};
pub use object::{HeapObject, ReferenceKind, TypeHandle};
pub use roots::{
    Diagnostic, PathNode, Root, RootFinder, RootKind, RootPath, RootReport, RootSearchOptions,
    SearchMode,
};
pub use session::{CancellationToken, HeapSession, ObjectInfo};
pub use target::{
    HeapMetadataService, SnapshotBuilder, StackWalker, TargetMemoryReader, TargetSnapshot,
};

/// Heapscope version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open a session with configuration taken from the environment
///
/// See [`SessionConfig::from_env`] for the recognized variables.
pub fn open_from_env<'t>(
    reader: &'t dyn TargetMemoryReader,
    metadata: &'t dyn HeapMetadataService,
) -> Result<HeapSession<'t>> {
    HeapSession::open(reader, metadata, SessionConfig::from_env())
}
