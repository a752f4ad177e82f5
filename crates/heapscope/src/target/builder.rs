//! Snapshot Builder - synthetic heaps
//!
//! Lays out types, segments, objects and roots the way the runtime does and
//! produces a [`TargetSnapshot`]. Used by replay tooling, tests and benches.
//!
//! Address plan (fits a 32-bit target):
//!
//! ```text
//! 0x0800_0000  handle slots
//! 0x0900_0000  finalizer queue, ready (1MB per heap)
//! 0x0A00_0000  finalizer queue, not ready (1MB per heap)
//! 0x0B00_0000  older-generation root array (1MB per heap)
//! 0x1000_0000  MethodTables, 4KB apart, GCDesc below each
//! 0x2000_0000  segments, 16MB apart
//! ```

use crate::object::TypeHandle;
use crate::target::snapshot::{SnapshotThread, SnapshotType};
use crate::target::{
    AllocContext, FinalizationData, GcHeapData, GenerationData, HandleEntry, HandleKind,
    HeapDetails, MethodTableLayout, RootArrayData, SegmentData, SlotRange, StackReference,
    TargetSnapshot,
};
use crate::util::Alignment;

const HANDLE_BASE: u64 = 0x0800_0000;
const FQ_READY_BASE: u64 = 0x0900_0000;
const FQ_NOT_READY_BASE: u64 = 0x0A00_0000;
const ROOT_ARRAY_BASE: u64 = 0x0B00_0000;
const TYPE_BASE: u64 = 0x1000_0000;
const TYPE_STRIDE: u64 = 0x1000;
const SEGMENT_BASE: u64 = 0x2000_0000;
const SEGMENT_STRIDE: u64 = 0x0100_0000;
const STACK_BASE: u64 = 0x0700_0000;
const HEAP_SLOT_STRIDE: u64 = 0x0010_0000;
const MAX_GENERATION: u32 = 2;

struct BuilderSegment {
    mem: u64,
    bytes: Vec<u8>,
    large: bool,
    heap: usize,
}

impl BuilderSegment {
    fn end(&self) -> u64 {
        self.mem + self.bytes.len() as u64
    }
}

struct BuilderType {
    address: u64,
    name: String,
    layout: MethodTableLayout,
    descriptor: Vec<u8>,
}

/// Per-heap roots and generation bookkeeping
struct BuilderHeap {
    finalizable_ready: Vec<u64>,
    finalizable_not_ready: Vec<u64>,
    root_array: Vec<u64>,
    root_array_analyzed: bool,
    gen0_context: AllocContext,
    generation_starts: Option<(u64, u64)>,
}

impl Default for BuilderHeap {
    fn default() -> Self {
        Self {
            finalizable_ready: Vec::new(),
            finalizable_not_ready: Vec::new(),
            root_array: Vec::new(),
            root_array_analyzed: true,
            gen0_context: AllocContext::default(),
            generation_starts: None,
        }
    }
}

/// Builder for synthetic targets
///
/// Starts with one heap (workstation GC). [`begin_heap`](Self::begin_heap)
/// adds server-GC heaps; segments, objects, finalizer entries and
/// older-generation roots go to the current heap.
pub struct SnapshotBuilder {
    pointer_size: usize,
    types: Vec<BuilderType>,
    segments: Vec<BuilderSegment>,
    string_type: Option<TypeHandle>,
    free_type: Option<TypeHandle>,
    handle_slots: Vec<u64>,
    handles: Vec<HandleEntry>,
    threads: Vec<SnapshotThread>,
    heaps: Vec<BuilderHeap>,
    current_heap: usize,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBuilder {
    /// Builder for a 64-bit target
    pub fn new() -> Self {
        Self::with_pointer_size(8)
    }

    pub fn with_pointer_size(pointer_size: usize) -> Self {
        Self {
            pointer_size,
            types: Vec::new(),
            segments: Vec::new(),
            string_type: None,
            free_type: None,
            handle_slots: Vec::new(),
            handles: Vec::new(),
            threads: Vec::new(),
            heaps: vec![BuilderHeap::default()],
            current_heap: 0,
        }
    }

    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn heap_mut(&mut self) -> &mut BuilderHeap {
        &mut self.heaps[self.current_heap]
    }

    /// Add a heap and make it current; returns its index
    pub fn begin_heap(&mut self) -> usize {
        self.heaps.push(BuilderHeap::default());
        self.current_heap = self.heaps.len() - 1;
        self.current_heap
    }

    /// Number of heaps built so far
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    fn ptr(&self) -> u64 {
        self.pointer_size as u64
    }

    fn min_object_size(&self) -> u64 {
        3 * self.ptr()
    }

    fn encode(&self, value: u64) -> Vec<u8> {
        value.to_le_bytes()[..self.pointer_size].to_vec()
    }

    // ========================================================================
    // TYPES
    // ========================================================================

    fn push_type(
        &mut self,
        name: &str,
        layout: MethodTableLayout,
        descriptor: Vec<u8>,
    ) -> TypeHandle {
        let address = TYPE_BASE + TYPE_STRIDE * (self.types.len() as u64 + 1);
        self.types.push(BuilderType {
            address,
            name: name.to_string(),
            layout,
            descriptor,
        });
        TypeHandle::new(address)
    }

    /// Plain-object descriptor from reference field offsets
    fn plain_descriptor(&self, base_size: u64, ref_offsets: &[u64]) -> Vec<u8> {
        let mut offsets = ref_offsets.to_vec();
        offsets.sort_unstable();
        offsets.dedup();

        // runs of consecutive slots, (start, length in bytes)
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for off in offsets {
            match runs.last_mut() {
                Some((start, len)) if *start + *len == off => *len += self.ptr(),
                _ => runs.push((off, self.ptr())),
            }
        }
        self.series_descriptor(
            &runs
                .iter()
                .map(|&(start, len)| (start, len as i64 - base_size as i64))
                .collect::<Vec<_>>(),
        )
    }

    /// Descriptor from (start_offset, stored_size) series, ascending offsets
    fn series_descriptor(&self, series: &[(u64, i64)]) -> Vec<u8> {
        if series.is_empty() {
            return Vec::new();
        }
        // lowest series at the lowest address
        let mut bytes = Vec::new();
        for &(start, size) in series {
            bytes.extend(self.encode(size as u64));
            bytes.extend(self.encode(start));
        }
        bytes.extend(self.encode(series.len() as u64));
        bytes
    }

    /// Type with reference fields at `ref_offsets`
    pub fn add_type(&mut self, name: &str, base_size: u32, ref_offsets: &[u64]) -> TypeHandle {
        let descriptor = self.plain_descriptor(base_size as u64, ref_offsets);
        let layout = MethodTableLayout {
            base_size,
            component_size: 0,
            contains_pointers: !ref_offsets.is_empty(),
            collectible: false,
            loader_allocator_handle: 0,
        };
        self.push_type(name, layout, descriptor)
    }

    /// Collectible type; returns the type and its LoaderAllocator handle slot
    ///
    /// Point the slot at the LoaderAllocator object with [`write_pointer`](Self::write_pointer).
    pub fn add_collectible_type(
        &mut self,
        name: &str,
        base_size: u32,
        ref_offsets: &[u64],
    ) -> (TypeHandle, u64) {
        let handle = self.add_handle_slot(0);
        let descriptor = self.plain_descriptor(base_size as u64, ref_offsets);
        let layout = MethodTableLayout {
            base_size,
            component_size: 0,
            contains_pointers: !ref_offsets.is_empty(),
            collectible: true,
            loader_allocator_handle: handle,
        };
        (self.push_type(name, layout, descriptor), handle)
    }

    /// Array of references (`object[]`)
    pub fn add_reference_array_type(&mut self, name: &str) -> TypeHandle {
        let base_size = 3 * self.ptr();
        let descriptor = self.series_descriptor(&[(2 * self.ptr(), -(base_size as i64))]);
        let layout = MethodTableLayout {
            base_size: base_size as u32,
            component_size: self.pointer_size as u32,
            contains_pointers: true,
            collectible: false,
            loader_allocator_handle: 0,
        };
        self.push_type(name, layout, descriptor)
    }

    /// Array of value-type elements of `element_size` bytes with references
    /// at `ref_offsets` inside each element
    pub fn add_value_array_type(
        &mut self,
        name: &str,
        element_size: u32,
        ref_offsets: &[u64],
    ) -> TypeHandle {
        let base_size = 3 * self.ptr();
        let mut offsets = ref_offsets.to_vec();
        offsets.sort_unstable();
        offsets.dedup();

        let mut runs: Vec<(u64, u64)> = Vec::new();
        for off in offsets {
            match runs.last_mut() {
                Some((start, count)) if *start + *count * self.ptr() == off => *count += 1,
                _ => runs.push((off, 1)),
            }
        }

        let mut descriptor = Vec::new();
        if let Some(&(first, _)) = runs.first() {
            // items {pointers, skip}; the last skip wraps to the next element
            let mut items = Vec::new();
            for (i, &(start, count)) in runs.iter().enumerate() {
                let run_end = start + count * self.ptr();
                let next = runs
                    .get(i + 1)
                    .map_or(element_size as u64 + first, |&(s, _)| s);
                items.push((count, next - run_end));
            }

            let k = items.len();
            for &(pointers, skip) in items.iter().rev() {
                if self.pointer_size == 4 {
                    descriptor.extend((pointers as u16).to_le_bytes());
                    descriptor.extend((skip as u16).to_le_bytes());
                } else {
                    descriptor.extend((pointers as u32).to_le_bytes());
                    descriptor.extend((skip as u32).to_le_bytes());
                }
            }
            descriptor.extend(self.encode(2 * self.ptr() + first));
            descriptor.extend(self.encode((-(k as i64)) as u64));
        }

        let layout = MethodTableLayout {
            base_size: base_size as u32,
            component_size: element_size,
            contains_pointers: !runs.is_empty(),
            collectible: false,
            loader_allocator_handle: 0,
        };
        self.push_type(name, layout, descriptor)
    }

    /// `System.String`
    pub fn string_type(&mut self) -> TypeHandle {
        if let Some(th) = self.string_type {
            return th;
        }
        let layout = MethodTableLayout {
            base_size: (2 * self.ptr() + 4) as u32,
            component_size: 2,
            contains_pointers: false,
            collectible: false,
            loader_allocator_handle: 0,
        };
        let th = self.push_type("System.String", layout, Vec::new());
        self.string_type = Some(th);
        th
    }

    /// Free-space filler type
    pub fn free_type(&mut self) -> TypeHandle {
        if let Some(th) = self.free_type {
            return th;
        }
        let layout = MethodTableLayout {
            base_size: (2 * self.ptr()) as u32,
            component_size: 1,
            contains_pointers: false,
            collectible: false,
            loader_allocator_handle: 0,
        };
        let th = self.push_type("Free", layout, Vec::new());
        self.free_type = Some(th);
        th
    }

    fn layout_of(&self, th: TypeHandle) -> Option<MethodTableLayout> {
        self.types
            .iter()
            .find(|t| t.address == th.address())
            .map(|t| t.layout)
    }

    // ========================================================================
    // SEGMENTS & OBJECTS
    // ========================================================================

    fn new_segment(&mut self, large: bool) -> u64 {
        let mem = SEGMENT_BASE + SEGMENT_STRIDE * self.segments.len() as u64;
        self.segments.push(BuilderSegment {
            mem,
            bytes: Vec::new(),
            large,
            heap: self.current_heap,
        });
        mem
    }

    /// Start a new generation segment; later allocations go there
    pub fn begin_segment(&mut self) -> u64 {
        self.new_segment(false)
    }

    /// Start a new large-object segment
    pub fn begin_large_segment(&mut self) -> u64 {
        self.new_segment(true)
    }

    fn current_segment(&mut self, large: bool) -> &mut BuilderSegment {
        let heap = self.current_heap;
        let index = match self
            .segments
            .iter()
            .rposition(|s| s.large == large && s.heap == heap)
        {
            Some(index) => index,
            None => {
                self.new_segment(large);
                self.segments.len() - 1
            },
        };
        &mut self.segments[index]
    }

    /// Size the heap walker will compute for an instance
    pub fn object_size(&self, th: TypeHandle, count: u32, large: bool) -> u64 {
        let layout = self.layout_of(th).unwrap_or_default();
        let mut components = count as u64;
        if Some(th) == self.string_type {
            components += 1;
        }
        let raw = layout.base_size as u64 + layout.component_size as u64 * components;
        let alignment = if large { 8 } else { self.ptr() };
        Alignment::align_up(raw.max(self.min_object_size()), alignment).unwrap_or(raw)
    }

    fn place(&mut self, th: TypeHandle, count: u32, large: bool) -> u64 {
        let size = self.object_size(th, count, large);
        let mut header = self.encode(th.address());
        header.extend(count.to_le_bytes());
        let segment = self.current_segment(large);
        let address = segment.end();
        let start = segment.bytes.len();
        segment.bytes.resize(start + size as usize, 0);
        let n = header.len().min(size as usize);
        segment.bytes[start..start + n].copy_from_slice(&header[..n]);
        address
    }

    /// Allocate a non-array instance
    pub fn alloc(&mut self, th: TypeHandle) -> u64 {
        self.place(th, 0, false)
    }

    /// Allocate an array (or any component type) with `count` elements
    pub fn alloc_array(&mut self, th: TypeHandle, count: u32) -> u64 {
        self.place(th, count, false)
    }

    /// Allocate an array in the large-object segment
    pub fn alloc_large(&mut self, th: TypeHandle, count: u32) -> u64 {
        self.place(th, count, true)
    }

    /// Allocate a string of `len` characters
    pub fn alloc_string(&mut self, len: u32) -> u64 {
        let th = self.string_type();
        self.place(th, len, false)
    }

    /// Allocate a free object covering exactly `size` bytes
    pub fn alloc_free(&mut self, size: u64) -> u64 {
        let th = self.free_type();
        let base = 2 * self.ptr();
        let count = size.saturating_sub(base) as u32;
        self.place(th, count, false)
    }

    /// Reserve an allocation context of `len` bytes in the current segment
    ///
    /// `None` makes it the heap's generation-0 context, otherwise it belongs
    /// to the given thread (which is created if needed).
    pub fn reserve_alloc_context(&mut self, len: u64, thread: Option<u32>) -> AllocContext {
        let segment = self.current_segment(false);
        let ptr = segment.end();
        segment.bytes.resize(segment.bytes.len() + len as usize, 0);
        let context = AllocContext {
            ptr,
            limit: ptr + len,
        };
        match thread {
            None => self.heap_mut().gen0_context = context,
            Some(id) => self.thread_mut(id).data.allocation_context = context,
        }
        context
    }

    /// Write a pointer-sized value into already-allocated memory
    pub fn write_pointer(&mut self, address: u64, value: u64) {
        let bytes = self.encode(value);
        self.write_bytes(address, &bytes);
    }

    /// Point field `offset` of `object` at `target`
    pub fn set_field(&mut self, object: u64, offset: u64, target: u64) {
        self.write_pointer(object + offset, target);
    }

    /// Set element `index` of a reference array
    pub fn set_element(&mut self, array: u64, index: u64, target: u64) {
        let offset = 2 * self.ptr() + index * self.ptr();
        self.write_pointer(array + offset, target);
    }

    fn write_bytes(&mut self, address: u64, bytes: &[u8]) {
        if let Some(segment) = self
            .segments
            .iter_mut()
            .find(|s| s.mem <= address && address + bytes.len() as u64 <= s.end())
        {
            let offset = (address - segment.mem) as usize;
            segment.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
            return;
        }
        if address >= HANDLE_BASE && address < FQ_READY_BASE {
            let index = ((address - HANDLE_BASE) / self.ptr()) as usize;
            if let Some(slot) = self.handle_slots.get_mut(index) {
                let mut raw = [0u8; 8];
                raw[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
                *slot = u64::from_le_bytes(raw);
            }
        }
    }

    // ========================================================================
    // ROOTS
    // ========================================================================

    /// Allocate a handle slot holding `target`
    pub fn add_handle_slot(&mut self, target: u64) -> u64 {
        let address = HANDLE_BASE + self.ptr() * self.handle_slots.len() as u64;
        self.handle_slots.push(target);
        address
    }

    pub fn add_handle(&mut self, kind: HandleKind, target: u64, strong: bool) -> u64 {
        let handle = self.add_handle_slot(target);
        self.handles.push(HandleEntry {
            handle,
            kind,
            target,
            strong,
            secondary: 0,
            age: 0,
        });
        handle
    }

    pub fn add_strong_handle(&mut self, target: u64) -> u64 {
        self.add_handle(HandleKind::Strong, target, true)
    }

    /// Strong handle whose age bucket is `age`
    pub fn add_aged_handle(&mut self, target: u64, age: u32) -> u64 {
        let handle = self.add_strong_handle(target);
        if let Some(entry) = self.handles.last_mut() {
            entry.age = age;
        }
        handle
    }

    pub fn add_dependent_handle(&mut self, primary: u64, secondary: u64) -> u64 {
        let handle = self.add_handle_slot(primary);
        self.handles.push(HandleEntry {
            handle,
            kind: HandleKind::Dependent,
            target: primary,
            strong: false,
            secondary,
            age: 0,
        });
        handle
    }

    fn thread_mut(&mut self, os_thread_id: u32) -> &mut SnapshotThread {
        let index = match self
            .threads
            .iter()
            .position(|t| t.data.os_thread_id == os_thread_id)
        {
            Some(index) => index,
            None => {
                self.threads.push(SnapshotThread {
                    data: crate::target::ThreadData {
                        os_thread_id,
                        ..Default::default()
                    },
                    stack: Vec::new(),
                });
                self.threads.len() - 1
            },
        };
        &mut self.threads[index]
    }

    /// Register a stack root on `os_thread_id`
    pub fn add_stack_root(&mut self, os_thread_id: u32, object: u64) {
        let ptr = self.ptr();
        let thread = self.thread_mut(os_thread_id);
        let address = STACK_BASE
            + 0x10000 * os_thread_id as u64
            + ptr * thread.stack.len() as u64;
        thread.stack.push(StackReference {
            address,
            object,
            pinned: false,
            interior: false,
        });
    }

    /// Register `object` in the finalization queue
    pub fn add_finalizable(&mut self, object: u64, ready: bool) {
        let heap = self.heap_mut();
        if ready {
            heap.finalizable_ready.push(object);
        } else {
            heap.finalizable_not_ready.push(object);
        }
    }

    /// Append an entry to the older-generation root array
    pub fn add_older_generation_root(&mut self, object: u64) {
        self.heap_mut().root_array.push(object);
    }

    pub fn set_root_array_analyzed(&mut self, analyzed: bool) {
        self.heap_mut().root_array_analyzed = analyzed;
    }

    /// Generation-1 and generation-0 allocation starts in the ephemeral segment
    pub fn set_generation_starts(&mut self, gen1: u64, gen0: u64) {
        self.heap_mut().generation_starts = Some((gen1, gen0));
    }

    // ========================================================================
    // BUILD
    // ========================================================================

    fn slot_region(&self, base: u64, values: &[u64]) -> (SlotRange, Vec<u8>) {
        let bytes: Vec<u8> = values.iter().flat_map(|&v| self.encode(v)).collect();
        let range = SlotRange {
            start: base,
            end: base + bytes.len() as u64,
        };
        (range, bytes)
    }

    pub fn build(mut self) -> TargetSnapshot {
        for heap in 0..self.heaps.len() {
            if !self.segments.iter().any(|s| !s.large && s.heap == heap) {
                self.current_heap = heap;
                self.new_segment(false);
            }
        }

        let mut snapshot = TargetSnapshot {
            pointer_size: self.pointer_size,
            heap: GcHeapData {
                server_mode: self.heaps.len() > 1,
                heap_count: self.heaps.len(),
                max_generation: MAX_GENERATION,
                string_type: self.string_type.unwrap_or_default(),
                free_type: self.free_type.unwrap_or_default(),
            },
            ..Default::default()
        };

        for ty in &self.types {
            let mut region = ty.descriptor.clone();
            region.extend(self.encode(0));
            snapshot.map(ty.address - ty.descriptor.len() as u64, region);
            snapshot.types.insert(
                ty.address,
                SnapshotType {
                    name: ty.name.clone(),
                    layout: ty.layout,
                },
            );
        }

        let (_, handle_bytes) = self.slot_region(HANDLE_BASE, &self.handle_slots);
        if !handle_bytes.is_empty() {
            snapshot.map(HANDLE_BASE, handle_bytes);
        }

        for index in 0..self.heaps.len() {
            let details = self.build_heap(index, &mut snapshot);
            snapshot.heaps.push(details);
        }

        snapshot.handles = self.handles.clone();
        snapshot.threads = self.threads.clone();
        snapshot
    }

    /// Segment chains and root ranges of heap `index`
    fn build_heap(&self, index: usize, snapshot: &mut TargetSnapshot) -> HeapDetails {
        let heap = &self.heaps[index];

        // segment descriptors sit just below each segment's memory
        let descriptor = |mem: u64| mem - 0x1000;
        let chain = |large: bool| -> Vec<&BuilderSegment> {
            self.segments
                .iter()
                .filter(|s| s.large == large && s.heap == index)
                .collect()
        };
        let generation_chain = chain(false);
        let large_chain = chain(true);

        for list in [&generation_chain, &large_chain] {
            for (i, segment) in list.iter().enumerate() {
                let next = list.get(i + 1).map_or(0, |s| descriptor(s.mem));
                snapshot.segments.insert(
                    descriptor(segment.mem),
                    SegmentData {
                        address: descriptor(segment.mem),
                        mem: segment.mem,
                        allocated: segment.end(),
                        next,
                    },
                );
                if !segment.bytes.is_empty() {
                    snapshot.map(segment.mem, segment.bytes.clone());
                }
            }
        }

        let first = generation_chain[0];
        let ephemeral = generation_chain[generation_chain.len() - 1];
        let (gen1_start, gen0_start) = heap
            .generation_starts
            .unwrap_or((ephemeral.mem, ephemeral.mem));

        let mut generations = vec![GenerationData::default(); MAX_GENERATION as usize + 1];
        generations[0] = GenerationData {
            start_segment: descriptor(ephemeral.mem),
            allocation_start: gen0_start,
            allocation_context: heap.gen0_context,
        };
        generations[1] = GenerationData {
            start_segment: descriptor(ephemeral.mem),
            allocation_start: gen1_start,
            allocation_context: AllocContext::default(),
        };
        generations[MAX_GENERATION as usize] = GenerationData {
            start_segment: descriptor(first.mem),
            allocation_start: first.mem,
            allocation_context: AllocContext::default(),
        };

        let offset = HEAP_SLOT_STRIDE * index as u64;
        let (ready, ready_bytes) =
            self.slot_region(FQ_READY_BASE + offset, &heap.finalizable_ready);
        let (not_ready, not_ready_bytes) =
            self.slot_region(FQ_NOT_READY_BASE + offset, &heap.finalizable_not_ready);
        let (roots, root_bytes) = self.slot_region(ROOT_ARRAY_BASE + offset, &heap.root_array);
        for (range, bytes) in [
            (ready, ready_bytes),
            (not_ready, not_ready_bytes),
            (roots, root_bytes),
        ] {
            if !bytes.is_empty() {
                snapshot.map(range.start, bytes);
            }
        }

        HeapDetails {
            generations,
            large_object_segment: large_chain.first().map_or(0, |s| descriptor(s.mem)),
            ephemeral_segment: descriptor(ephemeral.mem),
            alloc_allocated: ephemeral.end(),
            finalization: FinalizationData { ready, not_ready },
            root_array: RootArrayData {
                address: roots.start,
                count: heap.root_array.len() as u64,
                analyzed: heap.root_array_analyzed,
            },
        }
    }
}
