//! Heap Topology - generations and segment chains
//!
//! Built once per session from the metadata service:
//!
//! ```text
//! heap 0:  gen2 chain:  [seg A] -> [seg B] -> [ephemeral seg]   (ends at alloc_allocated)
//!          LOH chain:   [loh 1] -> [loh 2]
//! heap 1:  ...
//! ```
//!
//! Inside the ephemeral segment the generations nest:
//! `mem <= gen1.allocation_start <= gen0.allocation_start <= alloc_allocated`.
//!
//! Every failure here is fatal: there is no safe walk without a known
//! topology.

use crate::config::SessionConfig;
use crate::error::{HeapError, Result};
use crate::target::{AllocContext, GcHeapData, HeapDetails, HeapMetadataService};

/// Which chain a segment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Generation,
    Ephemeral,
    LargeObject,
}

/// One tracked segment `[mem, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Address of the segment descriptor
    pub address: u64,
    pub mem: u64,
    /// `allocated`, or `alloc_allocated` for the ephemeral segment
    pub end: u64,
    pub heap: usize,
    pub kind: SegmentKind,
}

impl Segment {
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        self.mem <= address && address < self.end
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.mem
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == self.mem
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.kind == SegmentKind::LargeObject
    }
}

/// One logical GC heap
#[derive(Debug, Clone)]
pub struct HeapInfo {
    pub index: usize,
    pub details: HeapDetails,
    /// Indices into [`HeapTopology::segments`]
    pub segments: Vec<usize>,
}

impl HeapInfo {
    fn allocation_start(&self, generation: usize) -> u64 {
        self.details
            .generations
            .get(generation)
            .map_or(0, |g| g.allocation_start)
    }
}

/// Owner of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLocation {
    pub heap: usize,
    pub segment: usize,
}

/// Generations and segments of every heap
#[derive(Debug, Clone)]
pub struct HeapTopology {
    heap_data: GcHeapData,
    heaps: Vec<HeapInfo>,
    /// Walk order: per heap, generation chain then large-object chain
    segments: Vec<Segment>,
    /// Segment indices sorted by `mem`
    by_address: Vec<usize>,
    /// Active allocation contexts sorted by `ptr`
    alloc_contexts: Vec<AllocContext>,
}

impl HeapTopology {
    /// Query the metadata service and assemble the topology
    pub fn build(metadata: &dyn HeapMetadataService, config: &SessionConfig) -> Result<Self> {
        let heap_data = metadata.gc_heap_data()?;
        if heap_data.heap_count == 0 {
            return Err(HeapError::corruption(0, "GC reports zero heaps"));
        }

        let mut heaps = Vec::with_capacity(heap_data.heap_count);
        let mut segments: Vec<Segment> = Vec::new();
        let mut alloc_contexts = Vec::new();
        let max_gen = heap_data.max_generation as usize;

        for index in 0..heap_data.heap_count {
            let details = metadata.heap_details(index)?;
            if details.generations.len() != max_gen + 1 {
                return Err(HeapError::corruption(
                    0,
                    format!(
                        "heap {} reports {} generations, expected {}",
                        index,
                        details.generations.len(),
                        max_gen + 1
                    ),
                ));
            }

            let first = segments.len();
            let mut found_ephemeral = false;
            walk_chain(
                metadata,
                config,
                index,
                &details,
                details.generations[max_gen].start_segment,
                false,
                &mut segments,
                &mut found_ephemeral,
            )?;
            walk_chain(
                metadata,
                config,
                index,
                &details,
                details.large_object_segment,
                true,
                &mut segments,
                &mut found_ephemeral,
            )?;

            if found_ephemeral {
                check_generation_nesting(index, &details, &segments[first..])?;
            }

            if let Some(gen0) = details.generations.first() {
                if gen0.allocation_context.is_active() {
                    alloc_contexts.push(gen0.allocation_context);
                }
            }

            log::debug!(
                "heap {}: {} segment(s), ephemeral {:#x}",
                index,
                segments.len() - first,
                details.ephemeral_segment
            );

            heaps.push(HeapInfo {
                index,
                details,
                segments: (first..segments.len()).collect(),
            });
        }

        for thread in metadata.threads()? {
            if thread.allocation_context.is_active() {
                alloc_contexts.push(thread.allocation_context);
            }
        }
        alloc_contexts.sort_by_key(|c| c.ptr);
        alloc_contexts.dedup_by_key(|c| c.ptr);

        let mut by_address: Vec<usize> = (0..segments.len()).collect();
        by_address.sort_by_key(|&i| segments[i].mem);

        Ok(Self {
            heap_data,
            heaps,
            segments,
            by_address,
            alloc_contexts,
        })
    }

    pub fn heap_data(&self) -> &GcHeapData {
        &self.heap_data
    }

    pub fn max_generation(&self) -> u32 {
        self.heap_data.max_generation
    }

    pub fn heaps(&self) -> &[HeapInfo] {
        &self.heaps
    }

    /// Segments in walk order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn alloc_contexts(&self) -> &[AllocContext] {
        &self.alloc_contexts
    }

    /// Bytes covered by all tracked segments
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Heap and segment owning `address`, `None` outside every tracked range
    pub fn get_heap(&self, address: u64) -> Option<SegmentLocation> {
        let pos = self
            .by_address
            .partition_point(|&i| self.segments[i].mem <= address);
        let index = *self.by_address.get(pos.checked_sub(1)?)?;
        let segment = &self.segments[index];
        segment.contains(address).then_some(SegmentLocation {
            heap: segment.heap,
            segment: index,
        })
    }

    /// Generation of the object at `address`
    ///
    /// Large-object segments report `max_generation + 1`.
    pub fn generation_of(&self, address: u64) -> Option<u32> {
        let location = self.get_heap(address)?;
        let segment = &self.segments[location.segment];
        let max_gen = self.heap_data.max_generation;
        match segment.kind {
            SegmentKind::LargeObject => Some(max_gen + 1),
            SegmentKind::Generation => Some(max_gen),
            SegmentKind::Ephemeral => {
                let heap = &self.heaps[location.heap];
                if address >= heap.allocation_start(0) {
                    Some(0)
                } else if address >= heap.allocation_start(1) {
                    Some(1)
                } else {
                    Some(max_gen)
                }
            },
        }
    }

    /// Allocation context starting exactly at `address`
    pub fn alloc_context_at(&self, address: u64) -> Option<&AllocContext> {
        self.alloc_contexts
            .binary_search_by_key(&address, |c| c.ptr)
            .ok()
            .map(|i| &self.alloc_contexts[i])
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_chain(
    metadata: &dyn HeapMetadataService,
    config: &SessionConfig,
    heap: usize,
    details: &HeapDetails,
    start: u64,
    large: bool,
    segments: &mut Vec<Segment>,
    found_ephemeral: &mut bool,
) -> Result<()> {
    let chain_start = segments.len();
    let mut next = start;
    while next != 0 {
        // per chain; other heaps and chains do not count
        if segments.len() - chain_start >= config.max_segments {
            return Err(HeapError::corruption(
                next,
                format!(
                    "segment chain exceeds {} segments (circular chain?)",
                    config.max_segments
                ),
            ));
        }

        let data = metadata.heap_segment(heap, next)?;
        let ephemeral = !large && next == details.ephemeral_segment;
        let end = if ephemeral {
            details.alloc_allocated
        } else {
            data.allocated
        };

        if end < data.mem {
            return Err(HeapError::corruption(
                next,
                format!(
                    "segment end {:#x} below its start {:#x}",
                    end, data.mem
                ),
            ));
        }

        *found_ephemeral |= ephemeral;
        segments.push(Segment {
            address: next,
            mem: data.mem,
            end,
            heap,
            kind: if large {
                SegmentKind::LargeObject
            } else if ephemeral {
                SegmentKind::Ephemeral
            } else {
                SegmentKind::Generation
            },
        });
        log::trace!(
            "segment {:#x}: [{:#x}, {:#x}){}",
            next,
            data.mem,
            end,
            if large { " large" } else { "" }
        );
        next = data.next;
    }
    Ok(())
}

fn check_generation_nesting(
    heap: usize,
    details: &HeapDetails,
    segments: &[Segment],
) -> Result<()> {
    let Some(ephemeral) = segments.iter().find(|s| s.kind == SegmentKind::Ephemeral) else {
        return Ok(());
    };
    let gen0 = details.generations[0].allocation_start;
    let gen1 = details
        .generations
        .get(1)
        .map_or(gen0, |g| g.allocation_start);

    if !(ephemeral.mem <= gen1 && gen1 <= gen0 && gen0 <= ephemeral.end) {
        return Err(HeapError::corruption(
            ephemeral.address,
            format!(
                "heap {} generations do not nest: mem {:#x}, gen1 {:#x}, gen0 {:#x}, end {:#x}",
                heap, ephemeral.mem, gen1, gen0, ephemeral.end
            ),
        ));
    }
    Ok(())
}
