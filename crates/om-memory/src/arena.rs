//! Memory arena implementation

use crate::constants::*;
use crate::pages::pages_for;
use bytemuck::Pod;
use om_core::error::MemoryError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Page bookkeeping, guarded by the arena lock
struct AllocationState {
    /// One bit per page, set when the page belongs to a live region
    map: Vec<u64>,
    used_pages: u32,
    regions: usize,
}

impl AllocationState {
    fn is_used(&self, page: usize) -> bool {
        self.map[page / 64] & (1u64 << (page % 64)) != 0
    }

    fn set(&mut self, page: usize, used: bool) {
        if used {
            self.map[page / 64] |= 1u64 << (page % 64);
        } else {
            self.map[page / 64] &= !(1u64 << (page % 64));
        }
    }
}

/// Fixed-capacity guest memory arena
///
/// Guest addresses are byte offsets from the start of the arena. The
/// first [`GUARD_PAGES`] pages are never handed out.
pub struct MemoryArena {
    /// Host base pointer of the arena
    base: *mut u8,
    /// Capacity in bytes (page multiple)
    capacity: u32,
    state: Mutex<AllocationState>,
}

// Safety: the backing memory is only reached through `ArenaRegion`s, which
// own disjoint page ranges and require `&mut` for writes.
unsafe impl Send for MemoryArena {}
unsafe impl Sync for MemoryArena {}

impl MemoryArena {
    /// Reserve the arena
    pub fn new(capacity: u32) -> Result<Arc<Self>, MemoryError> {
        let num_pages = pages_for(capacity);
        if num_pages <= GUARD_PAGES {
            return Err(MemoryError::OutOfMemory {
                requested: capacity,
                available: 0,
            });
        }
        let capacity = num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(MemoryError::OutOfMemory {
                requested: capacity,
                available: 0,
            })?;

        let base = Self::allocate_backing(capacity as usize)?;

        let mut state = AllocationState {
            map: vec![0u64; (num_pages as usize).div_ceil(64)],
            used_pages: GUARD_PAGES,
            regions: 0,
        };
        for page in 0..GUARD_PAGES as usize {
            state.set(page, true);
        }

        debug!("Memory arena reserved: 0x{:x} bytes ({} pages)", capacity, num_pages);

        Ok(Arc::new(Self {
            base,
            capacity,
            state: Mutex::new(state),
        }))
    }

    #[cfg(unix)]
    fn allocate_backing(size: usize) -> Result<*mut u8, MemoryError> {
        use libc::{mmap, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::OutOfMemory {
                requested: size as u32,
                available: 0,
            });
        }

        Ok(ptr as *mut u8)
    }

    #[cfg(not(unix))]
    fn allocate_backing(size: usize) -> Result<*mut u8, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, PAGE_SIZE as usize).map_err(|_| {
            MemoryError::OutOfMemory {
                requested: size as u32,
                available: 0,
            }
        })?;

        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::OutOfMemory {
                requested: size as u32,
                available: 0,
            });
        }

        Ok(ptr)
    }

    /// Allocate one contiguous, zero-filled region
    ///
    /// The region is returned to the arena when dropped.
    pub fn allocate(self: &Arc<Self>, size: u32) -> Result<ArenaRegion, MemoryError> {
        let num_pages = pages_for(size);
        let total_pages = (self.capacity / PAGE_SIZE) as usize;

        let mut state = self.state.lock();
        let available = (total_pages as u32 - state.used_pages) * PAGE_SIZE;

        // First fit over the page bitmap
        let mut found_start = None;
        let mut consecutive = 0u32;

        for page in GUARD_PAGES as usize..total_pages {
            if state.is_used(page) {
                consecutive = 0;
                found_start = None;
                continue;
            }

            if consecutive == 0 {
                found_start = Some(page);
            }
            consecutive += 1;

            if consecutive >= num_pages {
                break;
            }
        }

        let start_page = match found_start {
            Some(start) if consecutive >= num_pages => start,
            _ => {
                return Err(MemoryError::OutOfMemory {
                    requested: size,
                    available,
                })
            }
        };

        for page in start_page..start_page + num_pages as usize {
            state.set(page, true);
        }
        state.used_pages += num_pages;
        state.regions += 1;
        drop(state);

        let base = start_page as u32 * PAGE_SIZE;
        let reserved = num_pages * PAGE_SIZE;

        // Regions never share pages, so clearing outside the lock is safe
        unsafe {
            std::ptr::write_bytes(self.base.add(base as usize), 0, reserved as usize);
        }

        debug!(
            "Arena region allocated: base=0x{:08x}, size=0x{:x} ({} pages)",
            base, size, num_pages
        );

        Ok(ArenaRegion {
            arena: Arc::clone(self),
            base,
            size,
            pages: num_pages,
        })
    }

    fn release(&self, base: u32, num_pages: u32) {
        let start_page = (base / PAGE_SIZE) as usize;

        let mut state = self.state.lock();
        for page in start_page..start_page + num_pages as usize {
            state.set(page, false);
        }
        state.used_pages -= num_pages;
        state.regions -= 1;

        trace!("Arena region released: base=0x{:08x} ({} pages)", base, num_pages);
    }

    /// Total capacity in bytes, including guard pages
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes currently owned by live regions and guard pages
    pub fn used(&self) -> u32 {
        self.state.lock().used_pages * PAGE_SIZE
    }

    /// Bytes not owned by any region (may be fragmented)
    pub fn available(&self) -> u32 {
        self.capacity - self.used()
    }

    /// Number of live regions
    pub fn region_count(&self) -> usize {
        self.state.lock().regions
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity as usize);
        }

        #[cfg(not(unix))]
        unsafe {
            let layout =
                std::alloc::Layout::from_size_align_unchecked(self.capacity as usize, PAGE_SIZE as usize);
            std::alloc::dealloc(self.base, layout);
        }
    }
}

/// Exclusive, contiguous slice of the arena owned by one guest app
///
/// Addresses passed to the accessors are absolute guest addresses.
pub struct ArenaRegion {
    arena: Arc<MemoryArena>,
    base: u32,
    size: u32,
    pages: u32,
}

impl ArenaRegion {
    /// Guest address of the first byte
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Usable size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Guest address one past the last byte
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    /// Arena the region was carved from
    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.arena
    }

    /// Check whether `[addr, addr + len)` lies inside the region
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base
            && (addr as u64 + len as u64) <= self.end() as u64
    }

    fn offset(&self, addr: u32, len: u32) -> Result<usize, MemoryError> {
        if self.contains(addr, len) {
            Ok((addr - self.base) as usize)
        } else {
            Err(MemoryError::OutOfBounds { addr, len })
        }
    }

    /// The whole region as bytes
    pub fn as_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.arena.base.add(self.base as usize), self.size as usize)
        }
    }

    /// The whole region as mutable bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.arena.base.add(self.base as usize),
                self.size as usize,
            )
        }
    }

    /// Host pointer to the first byte, for handing to the CPU core
    pub fn host_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }

    /// Borrow `len` bytes at `addr`
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<&[u8], MemoryError> {
        let offset = self.offset(addr, len)?;
        Ok(&self.as_slice()[offset..offset + len as usize])
    }

    /// Copy `data` to `addr`
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let len = u32::try_from(data.len()).map_err(|_| MemoryError::OutOfBounds {
            addr,
            len: u32::MAX,
        })?;
        let offset = self.offset(addr, len)?;
        self.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Fill `len` bytes at `addr` with `value`
    pub fn fill(&mut self, addr: u32, len: u32, value: u8) -> Result<(), MemoryError> {
        let offset = self.offset(addr, len)?;
        self.as_mut_slice()[offset..offset + len as usize].fill(value);
        Ok(())
    }

    /// Read a plain-old-data value in host byte order
    pub fn read<T: Pod>(&self, addr: u32) -> Result<T, MemoryError> {
        let bytes = self.read_bytes(addr, std::mem::size_of::<T>() as u32)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Write a plain-old-data value in host byte order
    pub fn write<T: Pod>(&mut self, addr: u32, value: T) -> Result<(), MemoryError> {
        self.write_bytes(addr, bytemuck::bytes_of(&value))
    }

    /// Read a little-endian u32 (guest byte order)
    #[inline]
    pub fn read_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        let value: u32 = self.read(addr)?;
        Ok(u32::from_le(value))
    }

    /// Write a little-endian u32 (guest byte order)
    #[inline]
    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(addr, value.to_le())
    }
}

impl std::fmt::Debug for ArenaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaRegion")
            .field("base", &format_args!("0x{:08x}", self.base))
            .field("size", &format_args!("0x{:x}", self.size))
            .finish()
    }
}

impl Drop for ArenaRegion {
    fn drop(&mut self) {
        self.arena.release(self.base, self.pages);
    }
}
