//! External memory seen by the transfer engine.
//!
//! A sparse, byte-addressed memory split into 4 KiB pages that are allocated
//! on first write. Named regions are tracked for debugging and, in strict
//! mode, define the decodable address space.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              HostMemory                  │
//! │   regions: "weights" "acts" "out" ...    │
//! │   pages:   BTreeMap<page, [u8; 4096]>    │
//! │   faults:  [start, end) ranges           │
//! └───────────────────┬──────────────────────┘
//!                     │ read_burst / write_burst
//!                     │ (Okay | SlaveError | DecodeError)
//!                     ▼
//!             ┌───────────────┐
//!             │ TransferEngine│
//!             └───────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use tritone_emu::device::host_memory::{BusResponse, HostMemory};
//!
//! let mut mem = HostMemory::new();
//! mem.allocate_region("acts", 0x1000_0000, 4096).unwrap();
//! mem.write_words(0x1000_0000, &[1, -2, 3, -4]);
//!
//! let burst = mem.read_burst(0x1000_0000, 16, 8);
//! assert_eq!(burst.response, BusResponse::Okay);
//! assert_eq!(burst.beats[1].as_slice(), &[3, -4]);
//! ```

use std::collections::BTreeMap;
use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;
use thiserror::Error;

use super::tritone_spec::{INLINE_BEAT_WORDS, WORD_BYTES};

/// One bus beat: `bytes_per_beat / 4` storage words.
pub type Beat = SmallVec<[i32; INLINE_BEAT_WORDS]>;

/// Bus response of a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusResponse {
    Okay,
    /// The target accepted the address but failed the access.
    SlaveError,
    /// No target decodes the address.
    DecodeError,
}

impl BusResponse {
    pub fn is_ok(self) -> bool {
        self == BusResponse::Okay
    }
}

/// Result of a read burst. `beats` is empty unless the response is `Okay`.
#[derive(Debug, Clone)]
pub struct ReadBurst {
    pub response: BusResponse,
    pub beats: Vec<Beat>,
}

/// A named memory region.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub name: String,
    pub base_address: u64,
    /// Size in bytes.
    pub size: usize,
    /// Bursts read from this region by the transfer engine.
    pub dma_reads: u64,
    /// Bursts written to this region by the transfer engine.
    pub dma_writes: u64,
}

impl MemoryRegion {
    pub fn new(name: impl Into<String>, base_address: u64, size: usize) -> Self {
        Self {
            name: name.into(),
            base_address,
            size,
            dma_reads: 0,
            dma_writes: 0,
        }
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr < self.base_address + self.size as u64
    }

    /// Whether `[addr, addr + len)` lies entirely inside the region.
    #[inline]
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        len > 0 && self.contains(addr) && addr + len as u64 <= self.base_address + self.size as u64
    }

    #[inline]
    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        let end = addr.saturating_add(len as u64);
        let region_end = self.base_address.saturating_add(self.size as u64);
        addr < region_end && end > self.base_address
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostMemoryError {
    #[error("region at 0x{new_base:016x} overlaps with '{existing_name}'")]
    RegionOverlap { new_base: u64, existing_name: String },

    #[error("region '{0}' not found")]
    RegionNotFound(String),
}

/// Sparse paged external memory with bus semantics.
pub struct HostMemory {
    /// page_address -> page data
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,
    regions: Vec<MemoryRegion>,
    faults: Vec<Range<u64>>,
    /// Reject accesses outside every region with `DecodeError`.
    strict: bool,
    total_bytes_written: u64,
    total_bytes_read: u64,
    error_responses: u64,
}

impl HostMemory {
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            regions: Vec::new(),
            faults: Vec::new(),
            strict: false,
            total_bytes_written: 0,
            total_bytes_read: 0,
            error_responses: 0,
        }
    }

    /// Memory that only decodes addresses inside allocated regions.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Register a named region. Pages are still allocated on demand.
    pub fn allocate_region(
        &mut self,
        name: impl Into<String>,
        base_address: u64,
        size: usize,
    ) -> Result<(), HostMemoryError> {
        let name = name.into();
        if let Some(existing) = self.regions.iter().find(|r| r.overlaps(base_address, size)) {
            return Err(HostMemoryError::RegionOverlap {
                new_base: base_address,
                existing_name: existing.name.clone(),
            });
        }
        log::debug!("Host region '{}' at 0x{:X} ({} bytes)", name, base_address, size);
        self.regions.push(MemoryRegion::new(name, base_address, size));
        Ok(())
    }

    pub fn region(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn region_at(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Base address of a named region.
    pub fn region_base(&self, name: &str) -> Result<u64, HostMemoryError> {
        self.region(name)
            .map(|r| r.base_address)
            .ok_or_else(|| HostMemoryError::RegionNotFound(name.to_string()))
    }

    /// Make every burst touching `range` answer with `SlaveError`.
    pub fn inject_fault(&mut self, range: Range<u64>) {
        log::debug!("Injecting bus fault at 0x{:X}..0x{:X}", range.start, range.end);
        self.faults.push(range);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    fn get_or_create_page(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        let page_addr = addr & Self::PAGE_MASK;
        self.pages
            .entry(page_addr)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    fn get_page(&self, addr: u64) -> Option<&[u8; Self::PAGE_SIZE]> {
        self.pages.get(&(addr & Self::PAGE_MASK)).map(|b| b.as_ref())
    }

    /// Write bytes, spanning pages as needed.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        let mut current = addr;
        let mut remaining = data;
        while !remaining.is_empty() {
            let offset = (current & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let chunk = remaining.len().min(Self::PAGE_SIZE - offset);
            let page = self.get_or_create_page(current);
            page[offset..offset + chunk].copy_from_slice(&remaining[..chunk]);
            current += chunk as u64;
            remaining = &remaining[chunk..];
        }
        self.total_bytes_written += data.len() as u64;
    }

    /// Read bytes. Unbacked pages read as zero.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        let mut current = addr;
        let mut filled = 0;
        while filled < buf.len() {
            let offset = (current & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let chunk = (buf.len() - filled).min(Self::PAGE_SIZE - offset);
            match self.get_page(current) {
                Some(page) => buf[filled..filled + chunk].copy_from_slice(&page[offset..offset + chunk]),
                None => buf[filled..filled + chunk].fill(0),
            }
            current += chunk as u64;
            filled += chunk;
        }
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_bytes(addr, &buf);
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        LittleEndian::read_u32(&buf)
    }

    /// Write signed 32-bit words (little-endian).
    pub fn write_words(&mut self, addr: u64, words: &[i32]) {
        let mut bytes = vec![0u8; words.len() * WORD_BYTES];
        LittleEndian::write_i32_into(words, &mut bytes);
        self.write_bytes(addr, &bytes);
    }

    /// Read signed 32-bit words (little-endian).
    pub fn read_words(&self, addr: u64, count: usize) -> Vec<i32> {
        let mut bytes = vec![0u8; count * WORD_BYTES];
        self.read_bytes(addr, &mut bytes);
        let mut words = vec![0i32; count];
        LittleEndian::read_i32_into(&bytes, &mut words);
        words
    }

    /// Bus-level response for an access to `[addr, addr + len)`.
    fn decode(&self, addr: u64, len: usize) -> BusResponse {
        if self.strict && !self.regions.iter().any(|r| r.covers(addr, len)) {
            return BusResponse::DecodeError;
        }
        let end = addr.saturating_add(len as u64);
        if self.faults.iter().any(|f| f.start < end && f.end > addr) {
            return BusResponse::SlaveError;
        }
        BusResponse::Okay
    }

    /// Read a `len`-byte burst split into beats of `bytes_per_beat` bytes.
    /// The last beat is short when `len` is not a whole number of beats.
    pub fn read_burst(&mut self, addr: u64, len: usize, bytes_per_beat: usize) -> ReadBurst {
        let response = self.decode(addr, len);
        if !response.is_ok() {
            self.error_responses += 1;
            return ReadBurst { response, beats: Vec::new() };
        }

        let words_per_beat = (bytes_per_beat / WORD_BYTES).max(1);
        let words = self.read_words(addr, len / WORD_BYTES);
        self.total_bytes_read += len as u64;
        if let Some(region) = self.regions.iter_mut().find(|r| r.overlaps(addr, len)) {
            region.dma_reads += 1;
        }

        ReadBurst {
            response,
            beats: words.chunks(words_per_beat).map(Beat::from_slice).collect(),
        }
    }

    /// Write a burst. Nothing is written unless the response is `Okay`.
    pub fn write_burst(&mut self, addr: u64, beats: &[Beat]) -> BusResponse {
        let len: usize = beats.iter().map(|b| b.len() * WORD_BYTES).sum();
        let response = self.decode(addr, len);
        if !response.is_ok() {
            self.error_responses += 1;
            return response;
        }

        let words: Vec<i32> = beats.iter().flat_map(|b| b.iter().copied()).collect();
        self.write_words(addr, &words);
        if let Some(region) = self.regions.iter_mut().find(|r| r.overlaps(addr, len)) {
            region.dma_writes += 1;
        }
        response
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Bytes delivered by successful read bursts.
    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    /// Bursts answered with an error response.
    pub fn error_responses(&self) -> u64 {
        self.error_responses
    }

    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    /// Clear contents, regions and faults.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.regions.clear();
        self.faults.clear();
        self.total_bytes_written = 0;
        self.total_bytes_read = 0;
        self.error_responses = 0;
    }

    /// Hexdump for debugging.
    pub fn hexdump(&self, addr: u64, len: usize) -> String {
        let mut buf = vec![0u8; len];
        self.read_bytes(addr, &mut buf);

        let mut out = String::new();
        for (i, chunk) in buf.chunks(16).enumerate() {
            out.push_str(&format!("{:016x}: ", addr + (i * 16) as u64));
            for (j, byte) in chunk.iter().enumerate() {
                if j == 8 {
                    out.push(' ');
                }
                out.push_str(&format!("{:02x} ", byte));
            }
            out.push('\n');
        }
        out
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("allocated_pages", &self.pages.len())
            .field("regions", &self.regions.len())
            .field("faults", &self.faults.len())
            .field("strict", &self.strict)
            .finish()
    }
}
