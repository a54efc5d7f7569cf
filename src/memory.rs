//! Target memory and executable-buffer collaborators.
//!
//! The engine never touches raw pointers. It reads and patches the target
//! through [`TargetMemory`] and obtains its detour buffer from an
//! [`ExecAllocator`]. [`ImageMemory`] and [`BumpAllocator`] are in-process
//! implementations used by the offline driver and the tests.

use crate::arch::Arch;
use crate::error::{Error, Result};

/// Read/write access to the address space holding the target binary.
pub trait TargetMemory {
    /// Fill `buf` with the bytes at `addr`.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Overwrite the bytes at `addr`.
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()>;
}

/// Allocator for executable memory reachable from the target by rel32.
pub trait ExecAllocator {
    fn allocate(&mut self, size: usize) -> Result<u64>;

    /// Release a buffer; `None` is a no-op.
    fn free(&mut self, addr: Option<u64>);
}

/// Read one machine word (little-endian, zero-extended).
pub fn read_word(mem: &dyn TargetMemory, addr: u64, arch: Arch) -> Result<u64> {
    let mut buf = [0u8; 8];
    let word = arch.word_size();
    mem.read(addr, &mut buf[..word])?;
    Ok(u64::from_le_bytes(buf))
}

/// Read `len` bytes into a freshly allocated vector.
pub fn read_vec(mem: &dyn TargetMemory, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory { size: len })?;
    buf.resize(len, 0);
    mem.read(addr, &mut buf)?;
    Ok(buf)
}

/// A mapped range of an [`ImageMemory`].
#[derive(Clone, Debug)]
pub struct Region {
    /// Start address of the region.
    pub base: u64,
    /// Region contents.
    pub data: Vec<u8>,
    /// Whether code may run from this region.
    pub executable: bool,
}

impl Region {
    /// End address (exclusive) of the region.
    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base && addr.saturating_add(len as u64) <= self.end()
    }
}

/// Sparse address space made of non-overlapping regions.
///
/// Regions are kept sorted by base address so lookups are a binary search.
#[derive(Clone, Debug, Default)]
pub struct ImageMemory {
    regions: Vec<Region>,
    writes: usize,
}

impl ImageMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` at `base`. Fails if it would overlap an existing region.
    pub fn map(&mut self, base: u64, data: Vec<u8>, executable: bool) -> Result<()> {
        let end = base
            .checked_add(data.len() as u64)
            .ok_or(Error::MemoryAccess { addr: base, size: data.len() })?;
        let idx = self.regions.partition_point(|r| r.base < base);
        let overlaps_prev = idx > 0 && self.regions[idx - 1].end() > base;
        let overlaps_next = idx < self.regions.len() && self.regions[idx].base < end;
        if overlaps_prev || overlaps_next {
            return Err(Error::MemoryAccess { addr: base, size: data.len() });
        }
        self.regions.insert(idx, Region { base, data, executable });
        Ok(())
    }

    /// Map `size` zero bytes at `base`.
    pub fn map_zeroed(&mut self, base: u64, size: usize, executable: bool) -> Result<()> {
        self.map(base, vec![0; size], executable)
    }

    /// Region containing `addr`, if any.
    pub fn region(&self, addr: u64) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.base <= addr);
        if idx > 0 {
            let region = &self.regions[idx - 1];
            if addr < region.end() {
                return Some(region);
            }
        }
        None
    }

    fn region_mut(&mut self, addr: u64) -> Option<&mut Region> {
        let idx = self.regions.partition_point(|r| r.base <= addr);
        if idx > 0 && addr < self.regions[idx - 1].end() {
            return Some(&mut self.regions[idx - 1]);
        }
        None
    }

    /// Whether `[addr, addr + len)` lies inside one mapped region.
    pub fn is_mapped(&self, addr: u64, len: usize) -> bool {
        self.region(addr).is_some_and(|r| r.contains(addr, len))
    }

    /// Copy of `len` bytes at `addr`.
    pub fn bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Number of successful writes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn iter_regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }
}

impl TargetMemory for ImageMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let region = self
            .region(addr)
            .filter(|r| r.contains(addr, buf.len()))
            .ok_or(Error::MemoryAccess { addr, size: buf.len() })?;
        let start = (addr - region.base) as usize;
        buf.copy_from_slice(&region.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let region = self
            .region_mut(addr)
            .filter(|r| r.contains(addr, bytes.len()))
            .ok_or(Error::MemoryAccess { addr, size: bytes.len() })?;
        let start = (addr - region.base) as usize;
        region.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}

/// Hands out consecutive chunks of a fixed address range.
///
/// The range itself must be mapped by the caller (for an [`ImageMemory`],
/// via [`ImageMemory::map_zeroed`]).
#[derive(Debug)]
pub struct BumpAllocator {
    base: u64,
    capacity: usize,
    used: usize,
    live: Vec<u64>,
    frees: usize,
}

impl BumpAllocator {
    pub fn new(base: u64, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            used: 0,
            live: Vec::new(),
            frees: 0,
        }
    }

    /// Addresses allocated and not yet freed.
    pub fn live(&self) -> &[u64] {
        &self.live
    }

    /// Number of successful `free` calls.
    pub fn free_count(&self) -> usize {
        self.frees
    }
}

impl ExecAllocator for BumpAllocator {
    fn allocate(&mut self, size: usize) -> Result<u64> {
        if size > self.capacity - self.used {
            return Err(Error::OutOfMemory { size });
        }
        let addr = self.base + self.used as u64;
        self.used += size;
        self.live.push(addr);
        Ok(addr)
    }

    fn free(&mut self, addr: Option<u64>) {
        let Some(addr) = addr else {
            return;
        };
        if let Some(pos) = self.live.iter().position(|&a| a == addr) {
            self.live.swap_remove(pos);
            self.frees += 1;
        }
    }
}
