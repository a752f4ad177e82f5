//! Edge Case Tests - Corruption, Cancellation and Degraded Targets
//!
//! These tests verify behavior when the target is not well-formed:
//! - Corrupt objects end a strict walk, careful walks skip the segment
//! - Unreadable memory ends the walk with `DataRead`
//! - Cancellation surfaces as `UserInterrupt`, never as a short success
//! - Broken topology is fatal at session open
//! - Missing root sources degrade queries into diagnostics
//!
//! ============================================================================
//! EACH TEST FINDS SPECIFIC EDGE CASE BUGS - DO NOT WEAKEN ASSERTIONS
//! ============================================================================

mod common;

use common::{open, open_with, uniform_heap, ChainFixture, CountingMetadata, LEAF_SIZE};
use heapscope::roots::Diagnostic;
use heapscope::target::{StackReference, ThreadData};
use heapscope::{
    CancellationToken, ConfigError, HeapError, HeapSession, Result, RootSearchOptions,
    SessionConfig, SnapshotBuilder, StackWalker, TargetSnapshot, WalkEvent,
};

/// Type handle no MethodTable lives at
const BOGUS_TYPE: u64 = 0xdead_0000;

/// ============================================================================
/// CORRUPTION
/// ============================================================================

/// Three objects, the third carrying an unresolvable type handle
fn corrupt_third(segments: usize) -> (TargetSnapshot, Vec<u64>) {
    let (mut snapshot, objects) = uniform_heap(segments, 5);
    snapshot
        .write_pointer(objects[2], BOGUS_TYPE)
        .expect("object memory is mapped");
    (snapshot, objects)
}

/// A strict walk yields the objects before the corruption, then the error
///
/// **Bug this finds:** swallowing corruption, or losing already-walked
/// objects
#[test]
fn test_corruption_ends_strict_walk() {
    // Arrange
    let (snapshot, objects) = corrupt_third(1);
    let session = open(&snapshot);

    // Act
    let items: Vec<Result<_>> = session.objects().collect();

    // Assert
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap().address, objects[0]);
    assert_eq!(items[1].as_ref().unwrap().address, objects[1]);
    match &items[2] {
        Err(HeapError::HeapCorruption { address, .. }) => assert_eq!(*address, objects[2]),
        other => panic!("expected HeapCorruption, got {:?}", other),
    }
}

/// A careful walk abandons only the corrupt segment
#[test]
fn test_careful_walk_resumes_next_segment() {
    // Arrange
    let (snapshot, objects) = corrupt_third(2);
    let session = open(&snapshot);

    // Act
    let mut walk = session.objects().careful(true);
    let items: Vec<Result<_>> = walk.by_ref().collect();

    // Assert - 2 good, 1 error, then all 5 of the second segment
    assert_eq!(items.len(), 8);
    assert!(items[2].is_err());
    let good: Vec<u64> = items
        .iter()
        .filter_map(|i| i.as_ref().ok())
        .map(|o| o.address)
        .collect();
    assert_eq!(good[..2], objects[..2]);
    assert_eq!(good[2..], objects[5..]);
    assert_eq!(walk.stats().segments_abandoned, 1);

    let events = session.events().events();
    assert!(events.iter().any(|e| matches!(
        e,
        WalkEvent::SegmentAbandoned { address, .. } if *address == objects[2]
    )));
}

/// Unmapped object memory ends the walk with `DataRead`
#[test]
fn test_unreadable_memory_ends_walk() {
    // Arrange - the ephemeral segment claims 64 unmapped bytes
    let (mut snapshot, objects) = uniform_heap(1, 3);
    snapshot.heaps[0].alloc_allocated += 64;
    let session = open(&snapshot);

    // Act
    let items: Vec<Result<_>> = session.objects().collect();

    // Assert
    assert_eq!(items.len(), 4);
    assert_eq!(items[2].as_ref().unwrap().address, objects[2]);
    assert!(matches!(items[3], Err(HeapError::DataRead { .. })));
}

/// A readable type handle with an unreadable component count
///
/// **Bug this finds:** a size failure ending the whole walk instead of
/// only the segment it occurs in
#[test]
fn test_unreadable_count_is_segment_local() {
    // Arrange - first segment: leaf, then an array whose count is unmapped
    let mut builder = SnapshotBuilder::new();
    let leaf = builder.add_type("Sample.Leaf", 24, &[]);
    let array = builder.add_reference_array_type("System.Object[]");
    let first = builder.begin_segment();
    let a = builder.alloc(leaf);
    let broken = builder.alloc_array(array, 0);
    builder.begin_segment();
    let c = builder.alloc(leaf);
    let mut snapshot = builder.build();
    let mut bytes = snapshot.unmap(first).expect("segment is mapped");
    bytes.truncate((broken + 8 - first) as usize);
    snapshot.map(first, bytes);
    let session = open(&snapshot);

    // Act
    let strict: Vec<Result<_>> = session.objects().collect();
    let careful: Vec<Result<_>> = session.objects().careful(true).collect();

    // Assert
    assert_eq!(strict.len(), 2);
    assert_eq!(strict[0].as_ref().unwrap().address, a);
    match &strict[1] {
        Err(HeapError::HeapCorruption { address, .. }) => assert_eq!(*address, broken),
        other => panic!("expected HeapCorruption, got {:?}", other),
    }

    assert_eq!(careful.len(), 3);
    assert!(careful[1].is_err());
    assert_eq!(careful[2].as_ref().unwrap().address, c);
}

/// Objects overrunning their segment are corruption
#[test]
fn test_object_overrunning_segment() {
    // Arrange - shrink the segment so the last object sticks out
    let (mut snapshot, _) = uniform_heap(1, 3);
    snapshot.heaps[0].alloc_allocated -= 8;
    let session = open(&snapshot);

    // Act
    let last = session.objects().last().unwrap();

    // Assert
    assert!(matches!(last, Err(HeapError::HeapCorruption { .. })));
}

/// Verification rejects misaligned objects
#[test]
fn test_verify_rejects_misaligned_object() {
    // Arrange - an 8-byte aligned object checked against 16-byte alignment
    let mut builder = SnapshotBuilder::new();
    let leaf = builder.add_type("Sample.Leaf", 24, &[]);
    builder.alloc(leaf);
    builder.alloc(leaf);
    let snapshot = builder.build();
    let config = SessionConfig {
        verify_objects: true,
        object_alignment: 16,
        large_object_alignment: 16,
        ..Default::default()
    };
    let session = open_with(&snapshot, config);

    // Act
    let items: Vec<Result<_>> = session.objects().collect();

    // Assert
    assert!(items
        .iter()
        .any(|i| matches!(i, Err(HeapError::HeapCorruption { .. }))));
}

/// ============================================================================
/// TOPOLOGY
/// ============================================================================

/// A circular segment chain hits the segment cap
///
/// **Bug this finds:** infinite loops on corrupt segment lists
#[test]
fn test_circular_segment_chain_is_fatal() {
    // Arrange
    let (mut snapshot, _) = uniform_heap(2, 1);
    let first = *snapshot.segments.keys().next().unwrap();
    let last = *snapshot.segments.keys().last().unwrap();
    snapshot.segments.get_mut(&last).unwrap().next = first;

    // Act
    let result = HeapSession::open(&snapshot, &snapshot, SessionConfig::default());

    // Assert
    assert!(matches!(result, Err(HeapError::HeapCorruption { .. })));
}

/// Missing heap details are fatal
#[test]
fn test_missing_heap_details_is_fatal() {
    // Arrange
    let (mut snapshot, _) = uniform_heap(1, 1);
    snapshot.heaps.clear();

    // Act
    let result = HeapSession::open(&snapshot, &snapshot, SessionConfig::default());

    // Assert
    assert!(matches!(result, Err(HeapError::DataRead { .. })));
}

/// Generations that do not nest in the ephemeral segment are corruption
#[test]
fn test_generations_must_nest() {
    // Arrange - gen0 starts before gen1
    let mut builder = SnapshotBuilder::new();
    let leaf = builder.add_type("Sample.Leaf", 24, &[]);
    let a = builder.alloc(leaf);
    let b = builder.alloc(leaf);
    builder.set_generation_starts(b, a);
    let snapshot = builder.build();

    // Act
    let result = HeapSession::open(&snapshot, &snapshot, SessionConfig::default());

    // Assert
    assert!(matches!(result, Err(HeapError::HeapCorruption { .. })));
}

/// Invalid configuration is rejected before any query
#[test]
fn test_invalid_configuration() {
    // Arrange
    let snapshot = SnapshotBuilder::new().build();
    let config = SessionConfig {
        page_size: 0,
        ..Default::default()
    };

    // Act
    let result = HeapSession::open(&snapshot, &snapshot, config);

    // Assert
    assert!(matches!(
        result,
        Err(HeapError::Configuration(ConfigError::InvalidPageSize(_)))
    ));
}

/// ============================================================================
/// CANCELLATION
/// ============================================================================

/// Cancelling after the first of 10,000 objects stops within one step
///
/// **Bug this finds:** cancellation ignored until the walk ends, or
/// reported as a successful short walk
#[test]
fn test_cancel_walk_after_first_object() {
    // Arrange
    let (snapshot, _) = uniform_heap(1, 10_000);
    let token = CancellationToken::new();
    let session = open(&snapshot).with_cancellation(token.clone());
    let mut walk = session.objects();

    // Act
    let first = walk.next();
    token.cancel();
    let second = walk.next();
    let rest = walk.count();

    // Assert
    assert!(matches!(first, Some(Ok(_))));
    assert!(matches!(second, Some(Err(HeapError::UserInterrupt))));
    assert_eq!(rest, 0);
}

/// Cancelling a root search discards its results
#[test]
fn test_cancel_root_search() {
    // Arrange
    let fixture = ChainFixture::new();
    let session = open(&fixture.snapshot);
    session.cancellation_token().cancel();

    // Act
    let result = session
        .root_finder()
        .find_roots(fixture.a, RootSearchOptions::default());

    // Assert
    assert!(matches!(result, Err(HeapError::UserInterrupt)));
    let events = session.events().events();
    assert!(events
        .iter()
        .any(|e| matches!(e, WalkEvent::QueryInterrupted { .. })));
}

/// Cancelling a retained-size computation
#[test]
fn test_cancel_retained_size() {
    // Arrange
    let fixture = ChainFixture::new();
    let session = open(&fixture.snapshot);
    session.cancellation_token().cancel();

    // Act
    let result = session.root_finder().retained_size(fixture.c);

    // Assert
    assert!(matches!(result, Err(HeapError::UserInterrupt)));
}

/// ============================================================================
/// DEGRADED QUERIES
/// ============================================================================

/// An unreadable object ends only its own branch
///
/// **Bug this finds:** one corrupt object aborting a whole root search
#[test]
fn test_unreadable_object_ends_branch_only() {
    // Arrange - root R references X (corrupt) and Y; Y references T
    let mut builder = SnapshotBuilder::new();
    let pair = builder.add_type("Sample.Pair", 32, &[8, 16]);
    let node = builder.add_type("Sample.Node", 32, &[8]);
    let leaf = builder.add_type("Sample.Leaf", 24, &[]);
    let r = builder.alloc(pair);
    let x = builder.alloc(node);
    let y = builder.alloc(node);
    let t = builder.alloc(leaf);
    builder.set_field(r, 8, x);
    builder.set_field(r, 16, y);
    builder.set_field(y, 8, t);
    builder.add_strong_handle(r);
    let mut snapshot = builder.build();
    snapshot.write_pointer(x, BOGUS_TYPE).unwrap();
    let session = open(&snapshot);

    // Act
    let report = session
        .root_finder()
        .find_roots(t, RootSearchOptions::default())
        .unwrap();

    // Assert
    assert_eq!(report.paths.len(), 1);
    assert_eq!(report.paths[0].addresses(), vec![r, y, t]);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::ObjectUnreadable { address, .. } if *address == x)));
    assert_eq!(report.stats.objects_unreadable, 1);
}

/// Oversized GCDesc is reported, the rest is still measured
#[test]
fn test_gc_desc_limit_degrades_retained_size() {
    // Arrange - 2 series where the limit allows 1
    let mut builder = SnapshotBuilder::new();
    let wide = builder.add_type("Sample.Wide", 40, &[8, 24]);
    let obj = builder.alloc(wide);
    let snapshot = builder.build();
    let config = SessionConfig {
        max_gc_desc_series: 1,
        ..Default::default()
    };
    let session = open_with(&snapshot, config);

    // Act
    let retained = session.root_finder().retained_size(obj).unwrap();

    // Assert
    assert_eq!(retained.objects, 0);
    assert!(matches!(
        retained.diagnostics[0],
        Diagnostic::ObjectUnreadable { address, .. } if address == obj
    ));
}

/// Without a handle table, stacks still root the target
#[test]
fn test_handle_table_unavailable() {
    // Arrange
    let mut builder = SnapshotBuilder::new();
    let leaf = builder.add_type("Sample.Leaf", 24, &[]);
    let t = builder.alloc(leaf);
    builder.add_strong_handle(t);
    builder.add_stack_root(4, t);
    let snapshot = builder.build();
    let mut metadata = CountingMetadata::new(&snapshot);
    metadata.fail_handles = true;
    let session = HeapSession::open(&snapshot, &metadata, SessionConfig::default()).unwrap();

    // Act
    let report = session
        .root_finder()
        .find_roots(t, RootSearchOptions::default())
        .unwrap();

    // Assert
    assert_eq!(report.paths.len(), 1);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::HandleTableUnavailable { .. })));
    assert!(report
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::DependentHandlesUnavailable { .. })));
}

/// Stack walker whose thread list is unavailable
struct BrokenStacks;

impl StackWalker for BrokenStacks {
    fn threads(&self) -> Result<Vec<ThreadData>> {
        Err(HeapError::query(0, "thread list"))
    }

    fn stack_references(&self, _os_thread_id: u32) -> Result<Vec<StackReference>> {
        Ok(Vec::new())
    }
}

#[test]
fn test_thread_list_unavailable() {
    // Arrange
    let fixture = ChainFixture::new();
    let walker = BrokenStacks;
    let session = open(&fixture.snapshot).with_stack_walker(&walker);

    // Act
    let report = session
        .root_finder()
        .find_roots(fixture.a, RootSearchOptions::default())
        .unwrap();

    // Assert - the handle still roots the chain
    assert_eq!(report.paths.len(), 1);
    assert!(matches!(
        report.diagnostics[0],
        Diagnostic::ThreadsUnavailable { .. }
    ));
}

/// An unreadable root-array slot loses only that slot
///
/// **Bug this finds:** one bad slot dropping every root after it
#[test]
fn test_unreadable_root_slot_keeps_later_roots() {
    // Arrange - slots 0 and 2 mapped, slot 1 not
    let mut builder = SnapshotBuilder::new();
    let leaf = builder.add_type("Sample.Leaf", 24, &[]);
    let a = builder.alloc(leaf);
    let b = builder.alloc(leaf);
    builder.add_older_generation_root(a);
    builder.add_older_generation_root(a);
    builder.add_older_generation_root(b);
    let mut snapshot = builder.build();
    let start = snapshot.heaps[0].root_array.address;
    snapshot.unmap(start);
    snapshot.map(start, a.to_le_bytes().to_vec());
    snapshot.map(start + 16, b.to_le_bytes().to_vec());
    let session = open(&snapshot);

    // Act
    let set = session.root_finder().enumerate_roots().unwrap();

    // Assert
    let objects: Vec<u64> = set.roots.iter().map(|r| r.object).collect();
    assert_eq!(objects, vec![a, b]);
    assert_eq!(set.diagnostics.len(), 1);
    assert!(matches!(
        set.diagnostics[0],
        Diagnostic::OlderGenerationSlotUnreadable { heap: 0, .. }
    ));
}

/// ============================================================================
/// SNAPSHOT FILES
/// ============================================================================

/// A saved snapshot walks identically after reload
#[test]
fn test_snapshot_file_round_trip() -> anyhow::Result<()> {
    // Arrange
    let (snapshot, expected) = uniform_heap(2, 4);
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("heap.json");
    snapshot.save(&path)?;

    // Act
    let restored = TargetSnapshot::load(&path)?;
    let session = HeapSession::open(&restored, &restored, SessionConfig::default())?;
    let objects = session.objects().collect::<Result<Vec<_>>>()?;

    // Assert
    let addresses: Vec<u64> = objects.iter().map(|o| o.address).collect();
    assert_eq!(addresses, expected);
    assert!(objects.iter().all(|o| o.size == LEAF_SIZE));
    Ok(())
}

/// A malformed snapshot file is a format error
#[test]
fn test_malformed_snapshot_file() -> anyhow::Result<()> {
    // Arrange
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ \"pointer_size\": 8, ")?;

    // Act
    let result = TargetSnapshot::load(&path);

    // Assert
    assert!(matches!(result, Err(HeapError::SnapshotFormat(_))));
    Ok(())
}
