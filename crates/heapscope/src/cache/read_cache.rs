//! Linear Read Cache
//!
//! Heap walks read memory in ascending order, a few words at a time. The
//! cache keeps a single page starting at the last missed address so those
//! reads cost one remote call per page.
//!
//! - Requests inside the page are served from it
//! - Anything else refills the page starting at the requested address; the
//!   page may come back short where mapped memory ends
//! - Requests larger than the page bypass it
//! - A failed refill falls back to a direct read of only the requested bytes

use crate::error::{HeapError, Result};
use crate::stats::CacheStats;
use crate::target::TargetMemoryReader;

/// Single-page read-through cache
#[derive(Debug)]
pub struct LinearReadCache {
    page_size: usize,
    page_start: u64,
    /// Empty when no page is loaded
    page: Vec<u8>,
    stats: CacheStats,
}

impl LinearReadCache {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            page_start: 0,
            page: Vec::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drop the cached page
    pub fn invalidate(&mut self) {
        self.page.clear();
        self.page_start = 0;
    }

    /// Offset of `[address, address + len)` inside the page, if fully cached
    fn page_offset(&self, address: u64, len: usize) -> Option<usize> {
        if self.page.is_empty() || address < self.page_start {
            return None;
        }
        let offset = usize::try_from(address - self.page_start).ok()?;
        let end = offset.checked_add(len)?;
        (end <= self.page.len()).then_some(offset)
    }

    /// Fill `out` from target memory at `address`
    pub fn read(
        &mut self,
        reader: &dyn TargetMemoryReader,
        address: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let len = out.len();
        if len == 0 {
            return Ok(());
        }

        if len > self.page_size {
            self.stats.bypasses += 1;
            return direct(reader, address, out);
        }

        if let Some(offset) = self.page_offset(address, len) {
            self.stats.hits += 1;
            out.copy_from_slice(&self.page[offset..offset + len]);
            return Ok(());
        }

        self.stats.misses += 1;
        // clamp at the top of the address space
        let page_end = address.checked_add(self.page_size as u64).unwrap_or(u64::MAX);
        let page_len = (page_end - address) as u32;

        match reader.read_available(address, page_len) {
            Ok(bytes) if bytes.len() >= len => {
                self.page_start = address;
                self.page = bytes;
                out.copy_from_slice(&self.page[..len]);
                Ok(())
            },
            _ => {
                self.stats.failures += 1;
                self.invalidate();
                direct(reader, address, out)
            },
        }
    }

    /// Read one little-endian pointer of `pointer_size` bytes
    pub fn read_pointer(
        &mut self,
        reader: &dyn TargetMemoryReader,
        address: u64,
        pointer_size: usize,
    ) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(reader, address, &mut buf[..pointer_size])?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self, reader: &dyn TargetMemoryReader, address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(reader, address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

fn direct(reader: &dyn TargetMemoryReader, address: u64, out: &mut [u8]) -> Result<()> {
    let len = out.len();
    let length = u32::try_from(len).map_err(|_| HeapError::read(address, len))?;
    let bytes = reader.read(address, length)?;
    if bytes.len() < len {
        return Err(HeapError::read(address, len));
    }
    out.copy_from_slice(&bytes[..len]);
    Ok(())
}
