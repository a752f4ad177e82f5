//! Object Walker - lazy enumeration of heap objects
//!
//! Walks every tracked segment in topology order, one object at a time:
//!
//! 1. Poll cancellation
//! 2. Skip an allocation context starting at the cursor (to its limit)
//! 3. Read the type handle, resolve the layout, compute the aligned size
//! 4. Yield the object and advance by its size
//!
//! Failure classes:
//! - The type-handle word itself is unreadable (`DataRead`): the next
//!   position is unknown, so the whole walk ends.
//! - The word is readable but decodes to garbage, or the size cannot be
//!   computed from it (`HeapCorruption`): only this segment is affected.
//!   Strict walks end; careful walks resume at the next segment.
//!
//! Either way the error is yielded as an item, never swallowed.

use crate::error::{HeapError, Result};
use crate::heap::topology::Segment;
use crate::logging::WalkEvent;
use crate::object::{HeapObject, TypeHandle};
use crate::session::HeapSession;
use crate::stats::WalkStats;
use crate::util::Alignment;

/// Lazy, ascending walk over heap objects
pub struct ObjectIterator<'s, 't> {
    session: &'s HeapSession<'t>,
    start: u64,
    end: u64,
    /// Segment indices still to walk
    order: Vec<usize>,
    position: usize,
    cursor: u64,
    entered: bool,
    done: bool,
    careful: bool,
    stats: WalkStats,
}

impl<'s, 't> ObjectIterator<'s, 't> {
    /// Objects whose address lies in `[start, end)`
    pub(crate) fn new(session: &'s HeapSession<'t>, start: u64, end: u64) -> Self {
        let order = session
            .topology()
            .segments()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.mem < end && s.end > start)
            .map(|(i, _)| i)
            .collect();
        Self::with_order(session, start, end, order)
    }

    /// Objects of a single segment
    pub(crate) fn over_segment(session: &'s HeapSession<'t>, segment: usize) -> Self {
        Self::with_order(session, 0, u64::MAX, vec![segment])
    }

    fn with_order(session: &'s HeapSession<'t>, start: u64, end: u64, order: Vec<usize>) -> Self {
        Self {
            session,
            start,
            end,
            order,
            position: 0,
            cursor: 0,
            entered: false,
            done: false,
            careful: session.config().careful_walk,
            stats: WalkStats::default(),
        }
    }

    /// Override the session's careful-walk setting for this walk
    pub fn careful(mut self, careful: bool) -> Self {
        self.careful = careful;
        self
    }

    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    fn advance_segment(&mut self) {
        self.position += 1;
        self.entered = false;
    }

    fn finish(&mut self) {
        self.done = true;
        self.session.events().record(WalkEvent::WalkFinished {
            objects: self.stats.objects,
            bytes: self.stats.bytes,
            segments: self.stats.segments,
            segments_abandoned: self.stats.segments_abandoned,
        });
    }

    fn read_object(&self, segment: &Segment, index: usize, address: u64) -> Result<HeapObject> {
        let session = self.session;
        let config = session.config();

        let type_handle = TypeHandle::new(session.read_pointer(address)?);
        if type_handle.is_null() {
            return Err(HeapError::corruption(address, "null type handle"));
        }

        let layout = session
            .type_layout(type_handle)
            .map_err(|e| size_unavailable(address, e))?;
        let (_, size) = session
            .object_sizes(address, type_handle, &layout, segment.is_large())
            .map_err(|e| size_unavailable(address, e))?;
        if size == 0 {
            return Err(HeapError::corruption(address, "zero-sized object"));
        }

        let end = address
            .checked_add(size)
            .ok_or_else(|| HeapError::corruption(address, "object size overflows"))?;
        if end > segment.end {
            return Err(HeapError::corruption(
                address,
                format!(
                    "object of {} bytes overruns segment end {:#x}",
                    size, segment.end
                ),
            ));
        }

        if config.verify_objects {
            if (layout.base_size as u64) < config.min_object_size() {
                return Err(HeapError::corruption(
                    address,
                    format!("base size {} below minimum object size", layout.base_size),
                ));
            }
            let alignment = if segment.is_large() {
                config.large_object_alignment
            } else {
                config.object_alignment
            };
            if !Alignment::is_aligned(address, alignment as u64) {
                return Err(HeapError::corruption(address, "misaligned object"));
            }
        }

        Ok(HeapObject {
            address,
            type_handle,
            size,
            contains_pointers: layout.contains_pointers,
            collectible: layout.collectible,
            is_free: type_handle == session.topology().heap_data().free_type,
            heap: segment.heap,
            segment: index,
        })
    }
}

impl Iterator for ObjectIterator<'_, '_> {
    type Item = Result<HeapObject>;

    fn next(&mut self) -> Option<Result<HeapObject>> {
        loop {
            if self.done {
                return None;
            }

            let Some(&index) = self.order.get(self.position) else {
                self.finish();
                return None;
            };
            let segment = self.session.topology().segments()[index];
            if !self.entered {
                self.entered = true;
                self.cursor = segment.mem;
                self.stats.segments += 1;
            }

            if self.session.is_cancelled() {
                self.done = true;
                return Some(Err(HeapError::UserInterrupt));
            }

            if let Some(context) = self.session.topology().alloc_context_at(self.cursor) {
                self.cursor = context.limit;
                continue;
            }

            if self.cursor >= segment.end || self.cursor >= self.end {
                self.advance_segment();
                continue;
            }

            match self.read_object(&segment, index, self.cursor) {
                Ok(object) => {
                    self.cursor = object.end();
                    if object.address < self.start {
                        continue;
                    }
                    self.stats.objects += 1;
                    self.stats.bytes += object.size;
                    return Some(Ok(object));
                },
                Err(e) if e.ends_walk() => {
                    self.done = true;
                    return Some(Err(e));
                },
                Err(e) => {
                    log::warn!(
                        "segment {:#x}: walk stopped at {:#x}: {}",
                        segment.address,
                        self.cursor,
                        e
                    );
                    self.session.events().record(WalkEvent::SegmentAbandoned {
                        segment: segment.address,
                        address: self.cursor,
                        reason: e.to_string(),
                    });
                    if self.careful {
                        self.stats.segments_abandoned += 1;
                        self.advance_segment();
                    } else {
                        self.done = true;
                    }
                    return Some(Err(e));
                },
            }
        }
    }
}

/// A readable type handle whose layout or component count cannot be read
fn size_unavailable(address: u64, error: HeapError) -> HeapError {
    match error {
        HeapError::DataRead { .. } => {
            HeapError::corruption(address, format!("object size unavailable: {}", error))
        },
        other => other,
    }
}

/// Objects around an address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NearObjects {
    pub previous: Option<HeapObject>,
    /// Object whose extent covers the address
    pub containing: Option<HeapObject>,
    pub next: Option<HeapObject>,
}

/// Walk the segment owning `address` and report its neighbours
pub(crate) fn near_objects(session: &HeapSession<'_>, address: u64) -> Result<NearObjects> {
    let mut near = NearObjects::default();
    let Some(location) = session.topology().get_heap(address) else {
        return Ok(near);
    };

    for item in ObjectIterator::over_segment(session, location.segment).careful(false) {
        let object = item?;
        if object.end() <= address {
            near.previous = Some(object);
        } else if object.address <= address {
            near.containing = Some(object);
        } else {
            near.next = Some(object);
            break;
        }
    }
    Ok(near)
}
