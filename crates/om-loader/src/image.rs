//! Guest image layout and loading
//!
//! Planning is pure: it validates the segment table against the package
//! and computes where everything goes. Loading then allocates a single
//! arena region of `mem_size` bytes and copies the segments into it.

use crate::elf::{pf, ElfLoader};
use crate::tags::MreTags;
use bitflags::bitflags;
use om_core::error::LoaderError;
use om_memory::pages::{align_down, align_up};
use om_memory::{ArenaRegion, MemoryArena, PAGE_SIZE};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

bitflags! {
    /// Segment access flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u32 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

impl SegmentFlags {
    /// Convert ELF program header flags
    pub fn from_elf(p_flags: u32) -> Self {
        let mut flags = Self::empty();
        if p_flags & pf::R != 0 {
            flags |= Self::READ;
        }
        if p_flags & pf::W != 0 {
            flags |= Self::WRITE;
        }
        if p_flags & pf::X != 0 {
            flags |= Self::EXECUTE;
        }
        flags
    }
}

/// Where one loadable segment lands in the arena region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlacement {
    /// Program header index
    pub index: usize,
    pub file_offset: u32,
    pub file_size: u32,
    /// Offset from the region base
    pub dest_offset: u32,
    pub mem_size: u32,
    pub flags: SegmentFlags,
}

/// Validated memory layout of a guest image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageLayout {
    /// Virtual address mapped to the region base
    pub vaddr_base: u32,
    #[serde(skip)]
    pub segments: Vec<SegmentPlacement>,
    /// Entry point relative to the region base
    pub entry_offset: u32,
    /// Extent of the loaded segments, including inter-segment padding
    pub segments_size: u32,
    pub heap_size: u32,
    /// Total region size: page-aligned segments plus heap
    pub mem_size: u32,
    pub resource_offset: u32,
    pub resource_size: u32,
}

fn malformed(msg: impl Into<String>) -> LoaderError {
    LoaderError::MalformedImage(msg.into())
}

impl ImageLayout {
    /// Validate the segment table and compute the layout
    pub fn plan(
        elf: &ElfLoader,
        package_len: usize,
        tags: &MreTags,
        default_heap: u32,
    ) -> Result<Self, LoaderError> {
        let package_len = package_len as u64;
        let mut loads: Vec<_> = elf.loadable_segments().collect();

        if loads.is_empty() {
            return Err(malformed("No loadable segments"));
        }

        for &(index, phdr) in &loads {
            if phdr.p_filesz > phdr.p_memsz {
                return Err(malformed(format!(
                    "Segment {}: file size 0x{:x} exceeds memory size 0x{:x}",
                    index, phdr.p_filesz, phdr.p_memsz
                )));
            }

            let file_end = phdr.p_offset as u64 + phdr.p_filesz as u64;
            if file_end > package_len {
                return Err(malformed(format!(
                    "Segment {} extends beyond package: data at 0x{:x} with size 0x{:x} \
                     (ends at 0x{:x}) but package is only 0x{:x} bytes",
                    index, phdr.p_offset, phdr.p_filesz, file_end, package_len
                )));
            }

            if phdr.p_vaddr.checked_add(phdr.p_memsz).is_none() {
                return Err(malformed(format!(
                    "Segment {} at 0x{:08x} (+0x{:x}) wraps the address space",
                    index, phdr.p_vaddr, phdr.p_memsz
                )));
            }

            if phdr.p_align > 1 {
                if !phdr.p_align.is_power_of_two() {
                    return Err(malformed(format!(
                        "Segment {}: alignment 0x{:x} is not a power of two",
                        index, phdr.p_align
                    )));
                }
                if phdr.p_vaddr % phdr.p_align != phdr.p_offset % phdr.p_align {
                    return Err(malformed(format!(
                        "Segment {}: vaddr 0x{:x} and offset 0x{:x} disagree modulo alignment 0x{:x}",
                        index, phdr.p_vaddr, phdr.p_offset, phdr.p_align
                    )));
                }
            }
        }

        loads.sort_by_key(|(_, phdr)| phdr.p_vaddr);

        for pair in loads.windows(2) {
            let (prev_idx, prev) = pair[0];
            let (next_idx, next) = pair[1];
            if prev.p_vaddr + prev.p_memsz > next.p_vaddr {
                return Err(malformed(format!(
                    "Segments {} (0x{:08x}..0x{:08x}) and {} (0x{:08x}..) overlap",
                    prev_idx,
                    prev.p_vaddr,
                    prev.p_vaddr + prev.p_memsz,
                    next_idx,
                    next.p_vaddr
                )));
            }
        }

        // Keep intra-page offsets so page-level alignment survives relocation
        let vaddr_base = align_down(loads[0].1.p_vaddr, PAGE_SIZE);

        let segments: Vec<_> = loads
            .iter()
            .map(|&(index, phdr)| SegmentPlacement {
                index,
                file_offset: phdr.p_offset,
                file_size: phdr.p_filesz,
                dest_offset: phdr.p_vaddr - vaddr_base,
                mem_size: phdr.p_memsz,
                flags: SegmentFlags::from_elf(phdr.p_flags),
            })
            .collect();

        let segments_size = segments
            .iter()
            .map(|seg| seg.dest_offset + seg.mem_size)
            .max()
            .unwrap_or(0);

        // Thumb entry points carry the mode in bit 0
        let entry = elf.entry_point;
        let entry_addr = entry & !1;
        if entry_addr < vaddr_base || entry_addr - vaddr_base >= segments_size {
            return Err(malformed(format!(
                "Entry point 0x{:08x} lies outside the loaded image (0x{:08x}..0x{:08x})",
                entry,
                vaddr_base,
                vaddr_base as u64 + segments_size as u64
            )));
        }
        let entry_offset = entry - vaddr_base;

        let heap_size = tags.heap_size().unwrap_or(default_heap);
        let mem_size = align_up(segments_size, PAGE_SIZE)
            .and_then(|size| size.checked_add(heap_size))
            .ok_or_else(|| {
                malformed(format!(
                    "Memory requirement overflows: segments 0x{:x} + heap 0x{:x}",
                    segments_size, heap_size
                ))
            })?;

        let (resource_offset, resource_size) = Self::locate_resources(elf, package_len, tags)?;

        let layout = Self {
            vaddr_base,
            segments,
            entry_offset,
            segments_size,
            heap_size,
            mem_size,
            resource_offset,
            resource_size,
        };

        debug!("Planned image layout: {:?}", layout);
        Ok(layout)
    }

    fn locate_resources(
        elf: &ElfLoader,
        package_len: u64,
        tags: &MreTags,
    ) -> Result<(u32, u32), LoaderError> {
        let offset = elf.file_extent();
        let end = tags.block_offset.unwrap_or(package_len);

        if offset > end {
            return Err(malformed(format!(
                "ELF image (ends at 0x{:x}) overlaps the tag block at 0x{:x}",
                offset, end
            )));
        }

        let size = match tags.resource_size {
            Some(declared) => {
                if offset + declared as u64 > end {
                    return Err(LoaderError::ResourceBlobMissing {
                        offset,
                        size: declared as u64,
                        package_len,
                    });
                }
                declared as u64
            }
            None => end - offset,
        };

        // Both values are bounded by the package length, which the caller
        // keeps below 4 GiB.
        let offset = u32::try_from(offset).map_err(|_| malformed("Package exceeds 4 GiB"))?;
        let size = u32::try_from(size).map_err(|_| malformed("Package exceeds 4 GiB"))?;
        Ok((offset, size))
    }
}

/// Loader tunables
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Heap reserved when the package does not declare one
    pub default_heap_size: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            default_heap_size: 1024 * 1024,
        }
    }
}

/// A guest image copied into its arena region
#[derive(Debug)]
pub struct LoadedImage {
    pub region: ArenaRegion,
    pub layout: ImageLayout,
    pub tags: MreTags,
    /// Number of relocations applied while loading
    pub relocations: usize,
}

impl LoadedImage {
    /// Absolute guest address of the entry point
    pub fn entry_point(&self) -> u32 {
        self.region.base() + self.layout.entry_offset
    }

    pub fn base(&self) -> u32 {
        self.region.base()
    }

    pub fn segments_size(&self) -> u32 {
        self.layout.segments_size
    }

    pub fn mem_size(&self) -> u32 {
        self.layout.mem_size
    }

    pub fn resource_offset(&self) -> u32 {
        self.layout.resource_offset
    }

    pub fn resource_size(&self) -> u32 {
        self.layout.resource_size
    }
}

/// Parse a package and copy its image into a fresh arena region
///
/// On any error the region allocated for this attempt is released.
pub fn load_image(
    package: &[u8],
    arena: &Arc<MemoryArena>,
    options: &LoadOptions,
) -> Result<LoadedImage, LoaderError> {
    if u32::try_from(package.len()).is_err() {
        return Err(malformed(format!(
            "Package of {} bytes exceeds the 32-bit guest address space",
            package.len()
        )));
    }

    let tags = MreTags::parse(package)?;
    let elf = ElfLoader::new(&mut Cursor::new(package))?;
    let layout = ImageLayout::plan(&elf, package.len(), &tags, options.default_heap_size)?;

    let mut region = arena.allocate(layout.mem_size)?;
    elf.load_segments(package, &mut region, &layout)?;
    let relocations = elf.process_relocations(package, &mut region, layout.vaddr_base)?;

    let image = LoadedImage {
        region,
        layout,
        tags,
        relocations,
    };

    info!(
        "Image loaded: base=0x{:08x}, entry=0x{:08x}, segments=0x{:x}, mem=0x{:x}, resources=0x{:x}@0x{:x}",
        image.base(),
        image.entry_point(),
        image.segments_size(),
        image.mem_size(),
        image.resource_size(),
        image.resource_offset()
    );

    Ok(image)
}
