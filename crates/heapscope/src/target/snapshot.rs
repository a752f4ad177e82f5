//! Target Snapshot - captured target state
//!
//! A snapshot holds sparse memory regions plus the structured GC tables, and
//! implements both target collaborators over them. Snapshots round-trip
//! through JSON so a capture taken from a live process or dump can be
//! replayed later.

use crate::error::{HeapError, Result};
use crate::object::TypeHandle;
use crate::target::{
    GcHeapData, HandleEntry, HeapDetails, HeapMetadataService, MethodTableLayout, SegmentData,
    StackReference, TargetMemoryReader, ThreadData,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Type entry of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotType {
    pub name: String,
    pub layout: MethodTableLayout,
}

/// Thread entry of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotThread {
    #[serde(flatten)]
    pub data: ThreadData,
    #[serde(default)]
    pub stack: Vec<StackReference>,
}

/// Captured target state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub pointer_size: usize,
    pub heap: GcHeapData,
    pub heaps: Vec<HeapDetails>,
    /// Segment descriptors keyed by descriptor address
    pub segments: BTreeMap<u64, SegmentData>,
    /// Types keyed by MethodTable address
    pub types: BTreeMap<u64, SnapshotType>,
    #[serde(default)]
    pub handles: Vec<HandleEntry>,
    #[serde(default)]
    pub threads: Vec<SnapshotThread>,
    /// Non-overlapping memory regions keyed by start address
    pub memory: BTreeMap<u64, Vec<u8>>,
}

impl TargetSnapshot {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load a snapshot file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Write a snapshot file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Add a memory region; it must not overlap an existing one
    pub fn map(&mut self, address: u64, bytes: Vec<u8>) {
        self.memory.insert(address, bytes);
    }

    /// Remove the region starting at `address`
    pub fn unmap(&mut self, address: u64) -> Option<Vec<u8>> {
        self.memory.remove(&address)
    }

    /// Overwrite already-mapped memory
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let mut cursor = address;
        let mut written = 0usize;
        while written < bytes.len() {
            let (&base, region) = self
                .memory
                .range_mut(..=cursor)
                .next_back()
                .ok_or_else(|| HeapError::read(address, bytes.len()))?;
            let offset = (cursor - base) as usize;
            if offset >= region.len() {
                return Err(HeapError::read(address, bytes.len()));
            }
            let take = (region.len() - offset).min(bytes.len() - written);
            region[offset..offset + take].copy_from_slice(&bytes[written..written + take]);
            written += take;
            cursor += take as u64;
        }
        Ok(())
    }

    /// Overwrite one pointer-sized word
    pub fn write_pointer(&mut self, address: u64, value: u64) -> Result<()> {
        let bytes = value.to_le_bytes();
        let size = self.pointer_size;
        self.write(address, &bytes[..size])
    }

    fn thread(&self, os_thread_id: u32) -> Option<&SnapshotThread> {
        self.threads
            .iter()
            .find(|t| t.data.os_thread_id == os_thread_id)
    }
}

impl TargetMemoryReader for TargetSnapshot {
    fn read(&self, address: u64, length: u32) -> Result<Vec<u8>> {
        let bytes = self.read_available(address, length)?;
        if bytes.len() < length as usize {
            return Err(HeapError::read(address, length as usize));
        }
        Ok(bytes)
    }

    fn read_available(&self, address: u64, length: u32) -> Result<Vec<u8>> {
        let length = length as usize;
        let end = address.saturating_add(length as u64);

        let mut out = Vec::with_capacity(length);
        let mut cursor = address;
        while cursor < end {
            let Some((&base, region)) = self.memory.range(..=cursor).next_back() else {
                break;
            };
            let offset = (cursor - base) as usize;
            if offset >= region.len() {
                break;
            }
            let take = (region.len() - offset).min((end - cursor) as usize);
            out.extend_from_slice(&region[offset..offset + take]);
            cursor += take as u64;
        }

        if out.is_empty() && length > 0 {
            return Err(HeapError::read(address, length));
        }
        Ok(out)
    }
}

impl HeapMetadataService for TargetSnapshot {
    fn gc_heap_data(&self) -> Result<GcHeapData> {
        Ok(self.heap.clone())
    }

    fn heap_details(&self, heap: usize) -> Result<HeapDetails> {
        self.heaps
            .get(heap)
            .cloned()
            .ok_or_else(|| HeapError::query(heap as u64, "heap details"))
    }

    fn heap_segment(&self, _heap: usize, segment: u64) -> Result<SegmentData> {
        self.segments
            .get(&segment)
            .copied()
            .ok_or_else(|| HeapError::query(segment, "heap segment"))
    }

    fn method_table_layout(&self, type_handle: TypeHandle) -> Result<MethodTableLayout> {
        self.types
            .get(&type_handle.address())
            .map(|t| t.layout)
            .ok_or_else(|| HeapError::query(type_handle.address(), "method table"))
    }

    fn type_name(&self, type_handle: TypeHandle) -> Result<String> {
        self.types
            .get(&type_handle.address())
            .map(|t| t.name.clone())
            .ok_or_else(|| HeapError::query(type_handle.address(), "type name"))
    }

    fn handle_table(&self, generation: Option<u32>) -> Result<Vec<HandleEntry>> {
        Ok(self
            .handles
            .iter()
            .filter(|h| generation.map_or(true, |g| h.age <= g))
            .copied()
            .collect())
    }

    fn threads(&self) -> Result<Vec<ThreadData>> {
        Ok(self.threads.iter().map(|t| t.data).collect())
    }

    fn thread_stack_references(&self, os_thread_id: u32) -> Result<Vec<StackReference>> {
        self.thread(os_thread_id)
            .map(|t| t.stack.clone())
            .ok_or_else(|| HeapError::query(os_thread_id as u64, "thread stack"))
    }
}
