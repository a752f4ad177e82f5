//! Test Utilities for the Heapscope Test Suite
//!
//! Fixtures build synthetic targets through `SnapshotBuilder`, so every test
//! knows the exact address, size and type of each object it checks.
//!
//! ============================================================================
//! Assertions are exact: object counts, addresses and byte totals are known
//! up front, so there is nothing to tolerate.
//! ============================================================================

#![allow(dead_code)]

use heapscope::target::{
    GcHeapData, HandleEntry, HeapDetails, MethodTableLayout, SegmentData, StackReference,
    ThreadData,
};
use heapscope::{
    HeapError, HeapMetadataService, HeapObject, HeapSession, Result, SessionConfig,
    SnapshotBuilder, TargetMemoryReader, TargetSnapshot, TypeHandle,
};
use std::cell::Cell;

/// Default pointer size of fixtures
pub const POINTER_SIZE: u64 = 8;

/// Size of a leaf object with no fields beyond the header
pub const LEAF_SIZE: u64 = 24;

/// Size of an object with one reference field at offset 8
pub const NODE_SIZE: u64 = 32;

/// ============================================================================
/// SESSION HELPERS
/// ============================================================================

/// Open a session with default configuration over `snapshot`
///
/// **Bug this finds:** topology establishment failures on well-formed heaps
pub fn open(snapshot: &TargetSnapshot) -> HeapSession<'_> {
    HeapSession::open(snapshot, snapshot, SessionConfig::default())
        .expect("session should open over a well-formed snapshot")
}

/// Open a session with `config`
pub fn open_with(snapshot: &TargetSnapshot, config: SessionConfig) -> HeapSession<'_> {
    HeapSession::open(snapshot, snapshot, config)
        .expect("session should open over a well-formed snapshot")
}

/// Collect a full walk, failing on any yielded error
pub fn walk_all(session: &HeapSession<'_>) -> Vec<HeapObject> {
    session
        .objects()
        .collect::<Result<Vec<_>>>()
        .expect("walk over an intact heap should not fail")
}

/// ============================================================================
/// HEAP FIXTURES
/// ============================================================================

/// The three-object chain C -> B -> A, rooted at C by a strong handle
///
/// - A: 24 bytes, no references
/// - B: 32 bytes, references A at offset 8
/// - C: 32 bytes, references B at offset 8
pub struct ChainFixture {
    pub snapshot: TargetSnapshot,
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub handle: u64,
}

impl ChainFixture {
    /// **Bug this finds:** path reconstruction order, retained-size totals
    pub fn new() -> Self {
        let mut builder = SnapshotBuilder::new();
        let leaf = builder.add_type("Sample.A", LEAF_SIZE as u32, &[]);
        let node_b = builder.add_type("Sample.B", NODE_SIZE as u32, &[8]);
        let node_c = builder.add_type("Sample.C", NODE_SIZE as u32, &[8]);

        let a = builder.alloc(leaf);
        let b = builder.alloc(node_b);
        let c = builder.alloc(node_c);
        builder.set_field(b, 8, a);
        builder.set_field(c, 8, b);
        let handle = builder.add_strong_handle(c);

        Self {
            snapshot: builder.build(),
            a,
            b,
            c,
            handle,
        }
    }
}

/// `segments` segments of `per_segment` leaf objects each
///
/// **Bug this finds:** segment chaining, ordering and size accounting
pub fn uniform_heap(segments: usize, per_segment: usize) -> (TargetSnapshot, Vec<u64>) {
    let mut builder = SnapshotBuilder::new();
    let leaf = builder.add_type("Sample.Leaf", LEAF_SIZE as u32, &[]);
    let mut objects = Vec::with_capacity(segments * per_segment);
    for _ in 0..segments {
        builder.begin_segment();
        for _ in 0..per_segment {
            objects.push(builder.alloc(leaf));
        }
    }
    (builder.build(), objects)
}

/// Singly linked list of `len` nodes, head first
pub fn linked_list(builder: &mut SnapshotBuilder, len: usize) -> Vec<u64> {
    let node = builder.add_type("Sample.ListNode", NODE_SIZE as u32, &[8]);
    let nodes: Vec<u64> = (0..len).map(|_| builder.alloc(node)).collect();
    for pair in nodes.windows(2) {
        builder.set_field(pair[0], 8, pair[1]);
    }
    nodes
}

/// ============================================================================
/// INSTRUMENTED COLLABORATORS
/// ============================================================================

/// Memory reader that counts remote calls
pub struct CountingReader<'a> {
    pub inner: &'a TargetSnapshot,
    pub reads: Cell<u64>,
}

impl<'a> CountingReader<'a> {
    pub fn new(inner: &'a TargetSnapshot) -> Self {
        Self {
            inner,
            reads: Cell::new(0),
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.get()
    }
}

impl TargetMemoryReader for CountingReader<'_> {
    fn read(&self, address: u64, length: u32) -> Result<Vec<u8>> {
        self.reads.set(self.reads.get() + 1);
        self.inner.read(address, length)
    }

    fn read_available(&self, address: u64, length: u32) -> Result<Vec<u8>> {
        self.reads.set(self.reads.get() + 1);
        self.inner.read_available(address, length)
    }
}

/// Metadata service that counts type queries and can withhold sources
pub struct CountingMetadata<'a> {
    pub inner: &'a TargetSnapshot,
    pub layout_queries: Cell<u64>,
    pub fail_handles: bool,
    pub fail_threads: bool,
}

impl<'a> CountingMetadata<'a> {
    pub fn new(inner: &'a TargetSnapshot) -> Self {
        Self {
            inner,
            layout_queries: Cell::new(0),
            fail_handles: false,
            fail_threads: false,
        }
    }

    pub fn layout_queries(&self) -> u64 {
        self.layout_queries.get()
    }
}

impl HeapMetadataService for CountingMetadata<'_> {
    fn gc_heap_data(&self) -> Result<GcHeapData> {
        self.inner.gc_heap_data()
    }

    fn heap_details(&self, heap: usize) -> Result<HeapDetails> {
        self.inner.heap_details(heap)
    }

    fn heap_segment(&self, heap: usize, segment: u64) -> Result<SegmentData> {
        self.inner.heap_segment(heap, segment)
    }

    fn method_table_layout(&self, type_handle: TypeHandle) -> Result<MethodTableLayout> {
        self.layout_queries.set(self.layout_queries.get() + 1);
        self.inner.method_table_layout(type_handle)
    }

    fn type_name(&self, type_handle: TypeHandle) -> Result<String> {
        self.inner.type_name(type_handle)
    }

    fn handle_table(&self, generation: Option<u32>) -> Result<Vec<HandleEntry>> {
        if self.fail_handles {
            return Err(HeapError::query(0, "handle table"));
        }
        self.inner.handle_table(generation)
    }

    fn threads(&self) -> Result<Vec<ThreadData>> {
        if self.fail_threads {
            return Err(HeapError::query(0, "thread list"));
        }
        self.inner.threads()
    }

    fn thread_stack_references(&self, os_thread_id: u32) -> Result<Vec<StackReference>> {
        self.inner.thread_stack_references(os_thread_id)
    }
}

/// ============================================================================
/// ASSERTION HELPERS
/// ============================================================================

/// Assert addresses are strictly ascending
///
/// **Bug this finds:** walker revisiting or skipping backwards
pub fn assert_ascending(objects: &[HeapObject]) {
    for pair in objects.windows(2) {
        assert!(
            pair[0].address < pair[1].address,
            "walk went from {:#x} to {:#x}",
            pair[0].address,
            pair[1].address
        );
    }
}

/// Assert no two objects overlap
pub fn assert_disjoint(objects: &[HeapObject]) {
    for pair in objects.windows(2) {
        assert!(
            pair[0].end() <= pair[1].address,
            "object {:#x} (size {}) overlaps {:#x}",
            pair[0].address,
            pair[0].size,
            pair[1].address
        );
    }
}
