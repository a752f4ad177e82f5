//! Heap Session - one inspection of one stopped target
//!
//! The session owns everything that is only valid while the target stays
//! stopped: the topology, both caches and the event log. Components borrow
//! the session; nothing is process-global.
//!
//! # Threading
//!
//! Caches sit behind `RefCell`, so a session is `!Sync`. The
//! [`CancellationToken`] is the only piece meant to cross threads: a front
//! end may flip it while a walk or query runs.

use crate::cache::{LinearReadCache, MethodTableCache};
use crate::config::SessionConfig;
use crate::error::{HeapError, Result};
use crate::heap::walker::{self, NearObjects, ObjectIterator};
use crate::heap::HeapTopology;
use crate::logging::{EventLog, WalkEvent};
use crate::object::{HeapObject, ReferenceIterator, ReferenceKind, ReferenceLayout, TypeHandle};
use crate::roots::RootFinder;
use crate::stats::CacheStats;
use crate::target::{
    HeapMetadataService, MetadataStackWalker, MethodTableLayout, StackWalker, TargetMemoryReader,
};
use crate::util::Alignment;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared with a front end
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Resolved facts about one object, independent of any walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub address: u64,
    pub type_handle: TypeHandle,
    pub layout: MethodTableLayout,
    /// Unaligned instance size
    pub raw_size: u64,
    /// Aligned size as laid out in the heap
    pub size: u64,
}

/// Inspection session over a stopped target
pub struct HeapSession<'t> {
    reader: &'t dyn TargetMemoryReader,
    metadata: &'t dyn HeapMetadataService,
    stack_walker: Option<&'t dyn StackWalker>,
    config: SessionConfig,
    topology: HeapTopology,
    read_cache: RefCell<LinearReadCache>,
    types: RefCell<MethodTableCache>,
    empty_layout: Rc<ReferenceLayout>,
    events: EventLog,
    cancel: CancellationToken,
}

impl<'t> HeapSession<'t> {
    /// Validate `config` and establish the heap topology
    ///
    /// # Errors
    ///
    /// - `Configuration` if `config` is invalid
    /// - `DataRead` / `HeapCorruption` if the topology cannot be established
    pub fn open(
        reader: &'t dyn TargetMemoryReader,
        metadata: &'t dyn HeapMetadataService,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventLog::new(config.events.clone());
        let topology = build_topology(metadata, &config, &events)?;

        Ok(Self {
            reader,
            metadata,
            stack_walker: None,
            read_cache: RefCell::new(LinearReadCache::new(config.page_size)),
            types: RefCell::new(MethodTableCache::new()),
            empty_layout: Rc::new(ReferenceLayout::empty()),
            config,
            topology,
            events,
            cancel: CancellationToken::new(),
        })
    }

    /// Use `walker` instead of the metadata service for stack roots
    pub fn with_stack_walker(mut self, walker: &'t dyn StackWalker) -> Self {
        self.stack_walker = Some(walker);
        self
    }

    /// Share an existing cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Drop cached state and re-establish topology after the target ran
    pub fn refresh(&mut self) -> Result<()> {
        self.invalidate_caches();
        self.topology = build_topology(self.metadata, &self.config, &self.events)?;
        Ok(())
    }

    /// Forget every cached page and type
    pub fn invalidate_caches(&self) {
        self.read_cache.borrow_mut().invalidate();
        self.types.borrow_mut().invalidate();
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn topology(&self) -> &HeapTopology {
        &self.topology
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn metadata(&self) -> &'t dyn HeapMetadataService {
        self.metadata
    }

    pub(crate) fn reader(&self) -> &'t dyn TargetMemoryReader {
        self.reader
    }

    #[inline]
    pub fn pointer_size(&self) -> usize {
        self.config.pointer_size
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn read_cache_stats(&self) -> CacheStats {
        self.read_cache.borrow().stats()
    }

    pub fn type_cache_stats(&self) -> CacheStats {
        self.types.borrow().stats()
    }

    /// Layout queries issued to the metadata service so far
    pub fn type_queries(&self) -> u64 {
        self.types.borrow().queries()
    }

    /// Record both caches' statistics in the event log
    pub fn report_cache_stats(&self) {
        for (cache, stats) in [
            ("read", self.read_cache_stats()),
            ("method_table", self.type_cache_stats()),
        ] {
            self.events.record(WalkEvent::CacheStats {
                cache: cache.to_string(),
                hits: stats.hits,
                misses: stats.misses,
                bypasses: stats.bypasses,
            });
        }
    }

    // ========================================================================
    // MEMORY
    // ========================================================================

    /// Read one target pointer through the read cache
    pub fn read_pointer(&self, address: u64) -> Result<u64> {
        self.read_cache
            .borrow_mut()
            .read_pointer(self.reader, address, self.config.pointer_size)
    }

    /// Read one target pointer as a signed value
    pub fn read_signed_pointer(&self, address: u64) -> Result<i64> {
        let raw = self.read_pointer(address)?;
        Ok(match self.config.pointer_size {
            4 => raw as u32 as i32 as i64,
            _ => raw as i64,
        })
    }

    pub fn read_u32(&self, address: u64) -> Result<u32> {
        self.read_cache.borrow_mut().read_u32(self.reader, address)
    }

    // ========================================================================
    // TYPES & OBJECTS
    // ========================================================================

    /// Layout of a type; unresolvable types are `HeapCorruption`
    pub fn type_layout(&self, type_handle: TypeHandle) -> Result<MethodTableLayout> {
        self.types.borrow_mut().layout(type_handle, self.metadata)
    }

    pub fn type_name(&self, type_handle: TypeHandle) -> String {
        self.types.borrow_mut().name(type_handle, self.metadata)
    }

    /// Unaligned and aligned size of an instance
    pub fn object_sizes(
        &self,
        address: u64,
        type_handle: TypeHandle,
        layout: &MethodTableLayout,
        large: bool,
    ) -> Result<(u64, u64)> {
        let mut raw = layout.base_size as u64;
        if layout.component_size != 0 {
            let count_address = address
                .checked_add(self.config.pointer_size as u64)
                .ok_or_else(|| HeapError::read(address, 4))?;
            let mut count = self.read_u32(count_address)? as u64;
            if type_handle == self.topology.heap_data().string_type {
                count += 1;
            }
            raw += layout.component_size as u64 * count;
        }

        let alignment = if large {
            self.config.large_object_alignment
        } else {
            self.config.object_alignment
        };
        let size = Alignment::align_up(raw.max(self.config.min_object_size()), alignment as u64)
            .ok_or_else(|| HeapError::corruption(address, "object size overflows"))?;
        Ok((raw, size))
    }

    /// Resolve the object at `address`
    pub fn inspect(&self, address: u64) -> Result<ObjectInfo> {
        let type_handle = TypeHandle::new(self.read_pointer(address)?);
        if type_handle.is_null() {
            return Err(HeapError::corruption(address, "null type handle"));
        }
        let layout = self.type_layout(type_handle)?;
        let large = self
            .topology
            .get_heap(address)
            .map_or(false, |loc| self.topology.segments()[loc.segment].is_large());
        let (raw_size, size) = self.object_sizes(address, type_handle, &layout, large)?;
        Ok(ObjectInfo {
            address,
            type_handle,
            layout,
            raw_size,
            size,
        })
    }

    /// Decoded GCDesc of a pointer-containing type, cached
    fn reference_layout(&self, type_handle: TypeHandle) -> Result<Rc<ReferenceLayout>> {
        self.types
            .borrow_mut()
            .references(type_handle, || self.decode_gc_desc(type_handle))
    }

    fn decode_gc_desc(&self, type_handle: TypeHandle) -> Result<ReferenceLayout> {
        let pointer_size = self.config.pointer_size;
        let mt = type_handle.address();
        let count_address = mt
            .checked_sub(pointer_size as u64)
            .ok_or_else(|| HeapError::corruption(mt, "MethodTable below GCDesc"))?;
        let count = self.read_signed_pointer(count_address)?;

        if count.unsigned_abs() > self.config.max_gc_desc_series as u64 {
            return Err(HeapError::exhausted(format!(
                "GCDesc of {} series at {:#x} exceeds limit {}",
                count, mt, self.config.max_gc_desc_series
            )));
        }

        let len = ReferenceLayout::descriptor_len(count, pointer_size)
            .ok_or_else(|| HeapError::exhausted(format!("GCDesc of {} series", count)))?;
        let start = mt
            .checked_sub(len as u64)
            .ok_or_else(|| HeapError::corruption(mt, "GCDesc extends below address zero"))?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| HeapError::exhausted(format!("GCDesc buffer of {} bytes", len)))?;
        bytes.resize(len, 0);
        self.read_cache
            .borrow_mut()
            .read(self.reader, start, &mut bytes)?;

        ReferenceLayout::decode(type_handle, count, &bytes, pointer_size)
    }

    fn references_of(
        &self,
        address: u64,
        type_handle: TypeHandle,
        layout: &MethodTableLayout,
        raw_size: u64,
    ) -> Result<ReferenceIterator> {
        let loader_allocator = layout
            .collectible
            .then_some(layout.loader_allocator_handle);
        if !layout.contains_pointers {
            return Ok(ReferenceIterator::loader_allocator_only(loader_allocator));
        }

        let refs = self.reference_layout(type_handle)?;
        let refs = if refs.is_empty() {
            Rc::clone(&self.empty_layout)
        } else {
            refs
        };
        ReferenceIterator::new(
            refs,
            address,
            raw_size,
            self.config.pointer_size,
            loader_allocator,
        )
    }

    /// Reference slots of a walked object
    ///
    /// Types without pointers resolve without touching target memory.
    pub fn references(&self, object: &HeapObject) -> Result<ReferenceIterator> {
        let layout = self.type_layout(object.type_handle)?;
        let raw_size = if layout.contains_pointers {
            self.object_sizes(object.address, object.type_handle, &layout, false)?
                .0
        } else {
            0
        };
        self.references_of(object.address, object.type_handle, &layout, raw_size)
    }

    /// Non-null objects referenced by `object`, in slot order
    pub fn outgoing(&self, object: &ObjectInfo) -> Result<Vec<(u64, ReferenceKind)>> {
        let mut targets = Vec::new();
        let refs = self.references_of(
            object.address,
            object.type_handle,
            &object.layout,
            object.raw_size,
        )?;
        for reference in refs {
            let target = self.read_pointer(reference.slot)?;
            if target != 0 {
                targets.push((target, reference.kind));
            }
        }
        Ok(targets)
    }

    // ========================================================================
    // WALKS & QUERIES
    // ========================================================================

    /// Walk every object of every heap
    pub fn objects(&self) -> ObjectIterator<'_, 't> {
        ObjectIterator::new(self, 0, u64::MAX)
    }

    /// Walk objects whose address lies in `[start, end)`
    pub fn objects_in(&self, start: u64, end: u64) -> ObjectIterator<'_, 't> {
        ObjectIterator::new(self, start, end)
    }

    /// Previous, containing and next object around `address`
    pub fn list_near_objects(&self, address: u64) -> Result<NearObjects> {
        walker::near_objects(self, address)
    }

    pub fn root_finder(&self) -> RootFinder<'_, 't> {
        RootFinder::new(self)
    }

    /// Run `f` against the configured stack walker
    pub(crate) fn with_stack_walker_do<R>(&self, f: impl FnOnce(&dyn StackWalker) -> R) -> R {
        match self.stack_walker {
            Some(walker) => f(walker),
            None => f(&MetadataStackWalker::new(self.metadata)),
        }
    }
}

fn build_topology(
    metadata: &dyn HeapMetadataService,
    config: &SessionConfig,
    events: &EventLog,
) -> Result<HeapTopology> {
    match HeapTopology::build(metadata, config) {
        Ok(topology) => {
            events.record(WalkEvent::TopologyBuilt {
                heaps: topology.heaps().len(),
                segments: topology.segments().len(),
                bytes: topology.total_bytes(),
            });
            Ok(topology)
        },
        Err(e) => {
            log::error!("heap topology unavailable: {}", e);
            Err(e)
        },
    }
}
