//! Target Module - the inspected process, seen through two collaborators
//!
//! - [`TargetMemoryReader`]: raw reads of target memory
//! - [`HeapMetadataService`]: structured GC facts (heaps, segments, types,
//!   handles, threads)
//!
//! Both may fail on any call; the engine never assumes the target is
//! well-formed. [`TargetSnapshot`] implements both over captured data.

pub mod builder;
pub mod snapshot;

pub use builder::SnapshotBuilder;
pub use snapshot::TargetSnapshot;

use crate::error::Result;
use crate::object::TypeHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw access to target memory
pub trait TargetMemoryReader {
    /// Read exactly `length` bytes at `address`
    ///
    /// Must return `DataRead` rather than panic on unmapped memory.
    fn read(&self, address: u64, length: u32) -> Result<Vec<u8>>;

    /// Read up to `length` bytes at `address`, stopping early at unmapped
    /// memory
    ///
    /// Used for cache page fills. Fails only if nothing at `address` is
    /// readable.
    fn read_available(&self, address: u64, length: u32) -> Result<Vec<u8>> {
        self.read(address, length)
    }
}

/// Structured GC facts about the target
pub trait HeapMetadataService {
    fn gc_heap_data(&self) -> Result<GcHeapData>;

    fn heap_details(&self, heap: usize) -> Result<HeapDetails>;

    fn heap_segment(&self, heap: usize, segment: u64) -> Result<SegmentData>;

    fn method_table_layout(&self, type_handle: TypeHandle) -> Result<MethodTableLayout>;

    fn type_name(&self, type_handle: TypeHandle) -> Result<String>;

    /// Handle table entries; `Some(gen)` restricts to handles aged `<= gen`
    fn handle_table(&self, generation: Option<u32>) -> Result<Vec<HandleEntry>>;

    fn threads(&self) -> Result<Vec<ThreadData>>;

    fn thread_stack_references(&self, os_thread_id: u32) -> Result<Vec<StackReference>>;
}

/// Source of per-thread stack roots
///
/// Any [`HeapMetadataService`] can serve as one; a front end with its own
/// unwinder may supply a different implementation.
pub trait StackWalker {
    fn threads(&self) -> Result<Vec<ThreadData>>;

    fn stack_references(&self, os_thread_id: u32) -> Result<Vec<StackReference>>;
}

/// [`StackWalker`] backed by the metadata service's stack queries
pub struct MetadataStackWalker<'t> {
    metadata: &'t dyn HeapMetadataService,
}

impl<'t> MetadataStackWalker<'t> {
    pub fn new(metadata: &'t dyn HeapMetadataService) -> Self {
        Self { metadata }
    }
}

impl StackWalker for MetadataStackWalker<'_> {
    fn threads(&self) -> Result<Vec<ThreadData>> {
        self.metadata.threads()
    }

    fn stack_references(&self, os_thread_id: u32) -> Result<Vec<StackReference>> {
        self.metadata.thread_stack_references(os_thread_id)
    }
}

// ============================================================================
// HEAP-LEVEL FACTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcHeapData {
    pub server_mode: bool,
    pub heap_count: usize,
    pub max_generation: u32,
    /// MethodTable of `System.String`; one extra component is counted
    pub string_type: TypeHandle,
    /// MethodTable of free-space filler objects
    pub free_type: TypeHandle,
}

/// `[ptr, limit)` bump-allocation reservation holding no objects yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocContext {
    pub ptr: u64,
    pub limit: u64,
}

impl AllocContext {
    pub fn is_active(&self) -> bool {
        self.ptr != 0 && self.ptr < self.limit
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationData {
    pub start_segment: u64,
    pub allocation_start: u64,
    #[serde(default)]
    pub allocation_context: AllocContext,
}

/// Contiguous run of pointer-sized slots `[start, end)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u64,
    pub end: u64,
}

impl SlotRange {
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationData {
    /// Objects whose finalizer is due to run
    pub ready: SlotRange,
    /// Registered for finalization but still reachable otherwise
    pub not_ready: SlotRange,
}

/// Root array captured by the GC's last heap analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootArrayData {
    pub address: u64,
    pub count: u64,
    /// False when the analysis did not complete; the array is then unusable
    pub analyzed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapDetails {
    /// Indexed by generation, `0..=max_generation`
    pub generations: Vec<GenerationData>,
    /// First large-object segment, 0 if none
    pub large_object_segment: u64,
    pub ephemeral_segment: u64,
    /// Effective end of the ephemeral segment
    pub alloc_allocated: u64,
    #[serde(default)]
    pub finalization: FinalizationData,
    #[serde(default)]
    pub root_array: RootArrayData,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentData {
    /// Address of the segment descriptor itself
    pub address: u64,
    pub mem: u64,
    pub allocated: u64,
    /// Next segment in the chain, 0 at the end
    pub next: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodTableLayout {
    pub base_size: u32,
    pub component_size: u32,
    pub contains_pointers: bool,
    pub collectible: bool,
    /// Handle slot keeping the LoaderAllocator alive (collectible types)
    #[serde(default)]
    pub loader_allocator_handle: u64,
}

// ============================================================================
// ROOT SOURCES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    WeakShort,
    WeakLong,
    Strong,
    Pinned,
    Variable,
    RefCounted,
    Dependent,
    AsyncPinned,
    SizedRef,
    WeakNative,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::WeakShort => "weak short handle",
            HandleKind::WeakLong => "weak long handle",
            HandleKind::Strong => "strong handle",
            HandleKind::Pinned => "pinned handle",
            HandleKind::Variable => "variable handle",
            HandleKind::RefCounted => "ref counted handle",
            HandleKind::Dependent => "dependent handle",
            HandleKind::AsyncPinned => "async pinned handle",
            HandleKind::SizedRef => "sized ref handle",
            HandleKind::WeakNative => "weak native handle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleEntry {
    pub handle: u64,
    pub kind: HandleKind,
    /// Object the handle refers to (dependent handles: the primary)
    pub target: u64,
    /// Whether the handle keeps its target alive
    pub strong: bool,
    /// Dependent handles: object kept alive while the primary lives
    #[serde(default)]
    pub secondary: u64,
    /// Generation of the handle's age bucket
    #[serde(default)]
    pub age: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadData {
    pub os_thread_id: u32,
    #[serde(default)]
    pub allocation_context: AllocContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackReference {
    /// Stack slot or register save location
    pub address: u64,
    pub object: u64,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub interior: bool,
}
