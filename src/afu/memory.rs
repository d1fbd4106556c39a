//! Secondary flat memory behind the AFU.
//!
//! A separate address space the host can read and write through generic
//! memory commands, distinct from the configuration/MMIO space. Uses sparse
//! page-backed storage so the full 64-bit range costs nothing until touched;
//! the first touch of a page implicitly registers that page as known.

use std::collections::BTreeMap;

/// Sparse page-backed memory.
pub struct SparseMemory {
    /// page base address -> page bytes
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,
    total_bytes_written: u64,
    total_bytes_read: u64,
}

impl SparseMemory {
    /// Page granule for sparse storage (4 KiB).
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            total_bytes_written: 0,
            total_bytes_read: 0,
        }
    }

    fn page_mut(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        let base = addr & Self::PAGE_MASK;
        self.pages
            .entry(base)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    /// Write bytes, spanning pages as needed. Touched pages become known.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let mut cur = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let page = self.page_mut(cur);
            let offset = (cur & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let n = rest.len().min(Self::PAGE_SIZE - offset);
            page[offset..offset + n].copy_from_slice(&rest[..n]);
            cur += n as u64;
            rest = &rest[n..];
        }
        self.total_bytes_written += data.len() as u64;
    }

    /// Read bytes into `buf`. Reading also registers the touched pages, so a
    /// later `is_known` on the same address holds.
    pub fn read(&mut self, addr: u64, buf: &mut [u8]) {
        let mut cur = addr;
        let mut filled = 0;
        while filled < buf.len() {
            let page = self.page_mut(cur);
            let offset = (cur & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let n = (buf.len() - filled).min(Self::PAGE_SIZE - offset);
            buf[filled..filled + n].copy_from_slice(&page[offset..offset + n]);
            cur += n as u64;
            filled += n;
        }
        self.total_bytes_read += buf.len() as u64;
    }

    /// True when the page holding `addr` has been touched before.
    #[inline]
    pub fn is_known(&self, addr: u64) -> bool {
        self.pages.contains_key(&(addr & Self::PAGE_MASK))
    }

    /// Number of pages touched so far.
    #[inline]
    pub fn known_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    /// Drop all contents and registrations.
    pub fn reset(&mut self) {
        self.pages.clear();
        self.total_bytes_written = 0;
        self.total_bytes_read = 0;
    }
}

impl Default for SparseMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SparseMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseMemory")
            .field("known_pages", &self.pages.len())
            .field("total_bytes_written", &self.total_bytes_written)
            .field("total_bytes_read", &self.total_bytes_read)
            .finish()
    }
}
