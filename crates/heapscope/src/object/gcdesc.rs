//! GCDesc - per-type reference layout
//!
//! The runtime stores, just below each MethodTable that contains pointers, a
//! descriptor of which words of an instance are references. With `P` the
//! pointer size and `mt` the MethodTable address:
//!
//! ```text
//!            ┌───────────────────────────────┐
//!            │ ...                           │  lower series
//! mt-5P      │ series[1].size                │
//! mt-4P      │ series[1].start_offset        │
//! mt-3P      │ series[0].size                │  highest series
//! mt-2P      │ series[0].start_offset        │
//! mt-P       │ count (signed)                │
//! mt         │ MethodTable ...               │
//!            └───────────────────────────────┘
//! ```
//!
//! `count > 0`: plain object. Each series covers the reference slots
//! `[obj + start_offset, obj + start_offset + size + object_size)`; the
//! stored size is biased by the object size so the same series works for
//! arrays of references.
//!
//! `count = -k < 0`: array of value-type elements. `mt-2P` holds the offset
//! of the first element and `k` half-word pairs `{pointers, skip}` run
//! downward from `mt-3P`, one word each, so the descriptor spans `(k+2)P`.
//! The pair list describes one element and repeats until the end of the
//! array.
//!
//! Decoding is pure; the caller reads the descriptor bytes. Iteration yields
//! slot addresses only and performs no reads.

use crate::error::{HeapError, Result};
use crate::object::TypeHandle;
use std::rc::Rc;

/// One run of consecutive reference slots in a plain object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Series {
    pub start_offset: u64,
    /// Run length in bytes minus the object size
    pub size: i64,
}

/// One `{pointers, skip}` pair of an array-of-value-type element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueSeries {
    pub pointers: u32,
    pub skip: u32,
}

/// Decoded GCDesc
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceLayout {
    /// Series sorted by ascending start offset
    Plain(Vec<Series>),
    ArrayOfValueType {
        start_offset: u64,
        items: Vec<ValueSeries>,
        /// Bytes covered by one pass over `items`
        stride: u64,
    },
}

impl ReferenceLayout {
    /// Layout of a type without reference fields
    pub fn empty() -> Self {
        ReferenceLayout::Plain(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ReferenceLayout::Plain(series) if series.is_empty())
    }

    pub fn is_array_of_value_type(&self) -> bool {
        matches!(self, ReferenceLayout::ArrayOfValueType { .. })
    }

    /// Bytes below the MethodTable that hold a descriptor with `count` series
    ///
    /// `(2n+1)P` for `n` plain series, `(k+2)P` for `k` value-type pairs.
    /// `None` if the length does not fit in `usize`.
    pub fn descriptor_len(count: i64, pointer_size: usize) -> Option<usize> {
        let n = usize::try_from(count.unsigned_abs()).ok()?;
        let words = if count >= 0 {
            n.checked_mul(2)?.checked_add(1)?
        } else {
            n.checked_add(2)?
        };
        words.checked_mul(pointer_size)
    }

    /// Decode a descriptor
    ///
    /// `bytes` must cover `[mt - descriptor_len(count), mt)`.
    pub fn decode(mt: TypeHandle, count: i64, bytes: &[u8], pointer_size: usize) -> Result<Self> {
        let expected = Self::descriptor_len(count, pointer_size)
            .ok_or_else(|| HeapError::exhausted(format!("GCDesc of {} series", count)))?;
        if bytes.len() != expected {
            return Err(HeapError::corruption(
                mt.address(),
                format!("GCDesc buffer is {} bytes, expected {}", bytes.len(), expected),
            ));
        }

        let desc = Descriptor {
            bytes,
            pointer_size,
        };

        if count >= 0 {
            let mut series = Vec::new();
            series
                .try_reserve(count as usize)
                .map_err(|_| HeapError::exhausted(format!("GCDesc of {} series", count)))?;
            for i in 0..count as usize {
                series.push(Series {
                    start_offset: desc.word(1 + 2 * i),
                    size: desc.signed_word(2 + 2 * i),
                });
            }
            series.sort_by_key(|s| s.start_offset);
            return Ok(ReferenceLayout::Plain(series));
        }

        let k = count.unsigned_abs() as usize;
        let mut items = Vec::new();
        items
            .try_reserve(k)
            .map_err(|_| HeapError::exhausted(format!("GCDesc of {} value series", k)))?;

        let mut stride: u64 = 0;
        for j in 0..k {
            let item = desc.value_series(2 + j);
            stride = (item.pointers as u64)
                .checked_mul(pointer_size as u64)
                .and_then(|bytes| bytes.checked_add(item.skip as u64))
                .and_then(|bytes| stride.checked_add(bytes))
                .ok_or_else(|| HeapError::corruption(mt.address(), "GCDesc stride overflows"))?;
            items.push(item);
        }

        if stride == 0 {
            return Err(HeapError::corruption(
                mt.address(),
                "array element GCDesc has zero stride",
            ));
        }

        Ok(ReferenceLayout::ArrayOfValueType {
            start_offset: desc.word(1),
            items,
            stride,
        })
    }
}

/// Word access into a descriptor buffer, indexed downward from the MethodTable
struct Descriptor<'a> {
    bytes: &'a [u8],
    pointer_size: usize,
}

impl Descriptor<'_> {
    /// Bytes of the word at `mt - P * (k + 1)`
    fn slot(&self, k: usize) -> &[u8] {
        let end = self.bytes.len() - self.pointer_size * k;
        &self.bytes[end - self.pointer_size..end]
    }

    fn word(&self, k: usize) -> u64 {
        let slot = self.slot(k);
        match self.pointer_size {
            4 => u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as u64,
            _ => u64::from_le_bytes([
                slot[0], slot[1], slot[2], slot[3], slot[4], slot[5], slot[6], slot[7],
            ]),
        }
    }

    fn signed_word(&self, k: usize) -> i64 {
        match self.pointer_size {
            4 => self.word(k) as u32 as i32 as i64,
            _ => self.word(k) as i64,
        }
    }

    fn value_series(&self, k: usize) -> ValueSeries {
        let slot = self.slot(k);
        match self.pointer_size {
            4 => ValueSeries {
                pointers: u16::from_le_bytes([slot[0], slot[1]]) as u32,
                skip: u16::from_le_bytes([slot[2], slot[3]]) as u32,
            },
            _ => ValueSeries {
                pointers: u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]),
                skip: u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]),
            },
        }
    }
}

/// What an outgoing reference slot is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Ordinary reference field or array element
    Field,
    /// Handle keeping a collectible type's LoaderAllocator alive
    LoaderAllocator,
}

/// Address of a reference-bearing slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectReference {
    /// Reading a pointer at `slot` gives the referenced object
    pub slot: u64,
    pub kind: ReferenceKind,
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Series {
        index: usize,
        next: u64,
        end: u64,
    },
    Values {
        item: usize,
        remaining: u32,
        next: u64,
        end: u64,
    },
    LoaderAllocator,
    Done,
}

/// Lazy sequence of one object's reference slots
///
/// Ordinary slots come first in ascending address order. For a collectible
/// type the LoaderAllocator handle follows as the final item, even when the
/// type has no ordinary references.
pub struct ReferenceIterator {
    layout: Rc<ReferenceLayout>,
    object: u64,
    raw_size: u64,
    pointer_size: u64,
    loader_allocator: Option<u64>,
    cursor: Cursor,
}

impl ReferenceIterator {
    /// Iterate `object`'s slots
    ///
    /// `raw_size` is the unaligned instance size. Series that reach outside
    /// the object are reported as corruption here rather than during
    /// iteration.
    pub fn new(
        layout: Rc<ReferenceLayout>,
        object: u64,
        raw_size: u64,
        pointer_size: usize,
        loader_allocator: Option<u64>,
    ) -> Result<Self> {
        if let ReferenceLayout::Plain(series) = layout.as_ref() {
            for s in series {
                let span = (raw_size as i64).checked_add(s.size);
                let fits = span
                    .filter(|span| *span >= 0)
                    .and_then(|span| s.start_offset.checked_add(span as u64))
                    .map_or(false, |end| end <= raw_size);
                if !fits {
                    return Err(HeapError::corruption(
                        object,
                        format!(
                            "reference series at offset {:#x} exceeds object size {}",
                            s.start_offset, raw_size
                        ),
                    ));
                }
            }
        }

        let mut iter = Self {
            layout,
            object,
            raw_size,
            pointer_size: pointer_size as u64,
            loader_allocator,
            cursor: Cursor::Done,
        };
        iter.cursor = iter.first_cursor();
        Ok(iter)
    }

    /// Sequence holding only the LoaderAllocator handle, or nothing
    pub fn loader_allocator_only(loader_allocator: Option<u64>) -> Self {
        Self {
            layout: Rc::new(ReferenceLayout::empty()),
            object: 0,
            raw_size: 0,
            pointer_size: 0,
            loader_allocator,
            cursor: Cursor::LoaderAllocator,
        }
    }

    fn first_cursor(&self) -> Cursor {
        match self.layout.as_ref() {
            ReferenceLayout::Plain(_) => self.series_cursor(0),
            ReferenceLayout::ArrayOfValueType {
                start_offset,
                items,
                ..
            } => {
                let next = self.object + start_offset;
                let end = (self.object + self.raw_size).saturating_sub(self.pointer_size);
                match items.first() {
                    Some(first) if next < end => Cursor::Values {
                        item: 0,
                        remaining: first.pointers,
                        next,
                        end,
                    },
                    _ => Cursor::LoaderAllocator,
                }
            },
        }
    }

    fn series_cursor(&self, index: usize) -> Cursor {
        match self.layout.as_ref() {
            ReferenceLayout::Plain(series) => match series.get(index) {
                Some(s) => {
                    let next = self.object + s.start_offset;
                    // span validated in new()
                    let span = (self.raw_size as i64 + s.size) as u64;
                    Cursor::Series {
                        index,
                        next,
                        end: next + span,
                    }
                },
                None => Cursor::LoaderAllocator,
            },
            _ => Cursor::LoaderAllocator,
        }
    }
}

impl Iterator for ReferenceIterator {
    type Item = ObjectReference;

    fn next(&mut self) -> Option<ObjectReference> {
        loop {
            match self.cursor {
                Cursor::Series { index, next, end } => {
                    if next < end {
                        self.cursor = Cursor::Series {
                            index,
                            next: next + self.pointer_size,
                            end,
                        };
                        return Some(ObjectReference {
                            slot: next,
                            kind: ReferenceKind::Field,
                        });
                    }
                    self.cursor = self.series_cursor(index + 1);
                },
                Cursor::Values {
                    item,
                    remaining,
                    next,
                    end,
                } => {
                    let object_end = self.object + self.raw_size;
                    if remaining > 0 {
                        if next + self.pointer_size > object_end {
                            self.cursor = Cursor::LoaderAllocator;
                            continue;
                        }
                        self.cursor = Cursor::Values {
                            item,
                            remaining: remaining - 1,
                            next: next + self.pointer_size,
                            end,
                        };
                        return Some(ObjectReference {
                            slot: next,
                            kind: ReferenceKind::Field,
                        });
                    }

                    let items = match self.layout.as_ref() {
                        ReferenceLayout::ArrayOfValueType { items, .. } => items,
                        ReferenceLayout::Plain(_) => {
                            self.cursor = Cursor::LoaderAllocator;
                            continue;
                        },
                    };
                    let next = next + items[item].skip as u64;
                    let mut item = item + 1;
                    if item == items.len() {
                        if next >= end {
                            self.cursor = Cursor::LoaderAllocator;
                            continue;
                        }
                        item = 0;
                    }
                    self.cursor = Cursor::Values {
                        item,
                        remaining: items[item].pointers,
                        next,
                        end,
                    };
                },
                Cursor::LoaderAllocator => {
                    self.cursor = Cursor::Done;
                    if let Some(handle) = self.loader_allocator {
                        return Some(ObjectReference {
                            slot: handle,
                            kind: ReferenceKind::LoaderAllocator,
                        });
                    }
                },
                Cursor::Done => return None,
            }
        }
    }
}
