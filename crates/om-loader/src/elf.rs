//! ELF file parser

use om_core::error::{LoaderError, MemoryError};
use om_memory::ArenaRegion;
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, info, trace};

use crate::image::ImageLayout;

/// ELF file header (32-bit)
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF program header (32-bit)
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// ELF section header (32-bit)
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Elf32Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;

/// Header sizes for ELF32
pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;
pub const SHDR_SIZE: usize = 40;
pub const SYM_SIZE: usize = 16;
pub const REL_SIZE: usize = 8;

/// Object file types
pub mod et {
    pub const EXEC: u16 = 2;
    pub const DYN: u16 = 3;
}

/// Machine types
pub mod em {
    pub const ARM: u16 = 40;
}

/// Program header types
pub mod pt {
    pub const NULL: u32 = 0;
    pub const LOAD: u32 = 1;
}

/// Program header flags
pub mod pf {
    pub const X: u32 = 0x1;
    pub const W: u32 = 0x2;
    pub const R: u32 = 0x4;
}

/// Section header types
pub mod sht {
    pub const NULL: u32 = 0;
    pub const SYMTAB: u32 = 2;
    pub const STRTAB: u32 = 3;
    pub const NOBITS: u32 = 8;
    pub const REL: u32 = 9;
    pub const DYNSYM: u32 = 11;
}

/// Relocation types for ARM
pub mod r_arm {
    pub const NONE: u32 = 0;
    pub const ABS32: u32 = 2;
    pub const GLOB_DAT: u32 = 21;
    pub const JUMP_SLOT: u32 = 22;
    pub const RELATIVE: u32 = 23;
}

/// Symbol binding
pub const STB_GLOBAL: u8 = 1;

/// Symbol type
pub const STT_FUNC: u8 = 2;

/// Undefined section index
pub const SHN_UNDEF: u16 = 0;

/// Parsed symbol information
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u32,
    pub size: u32,
    pub bind: u8,
    pub sym_type: u8,
    pub section: u16,
}

impl Symbol {
    /// Check if symbol is defined in this image
    pub fn is_defined(&self) -> bool {
        self.section != SHN_UNDEF
    }
}

fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn malformed(msg: impl Into<String>) -> LoaderError {
    LoaderError::MalformedImage(msg.into())
}

/// ELF loader
pub struct ElfLoader {
    pub header: Elf32Header,
    pub phdrs: Vec<Elf32Phdr>,
    pub shdrs: Vec<Elf32Shdr>,
    pub symbols: Vec<Symbol>,
    pub entry_point: u32,
}

impl ElfLoader {
    /// Create a new ELF loader by parsing the file
    pub fn new<R: Read + Seek>(reader: &mut R) -> Result<Self, LoaderError> {
        let header = Self::parse_header(reader)?;
        let phdrs = Self::parse_phdrs(reader, &header)?;
        let shdrs = Self::parse_shdrs(reader, &header)?;

        let mut loader = Self {
            header,
            phdrs,
            shdrs,
            symbols: Vec::new(),
            entry_point: header.e_entry,
        };
        loader.parse_symbols(reader)?;

        info!(
            "ELF parsed: entry=0x{:x}, phdrs={}, shdrs={}, symbols={}",
            header.e_entry,
            loader.phdrs.len(),
            loader.shdrs.len(),
            loader.symbols.len()
        );

        Ok(loader)
    }

    fn stream_len<R: Seek>(reader: &mut R) -> Result<u64, LoaderError> {
        reader
            .seek(SeekFrom::End(0))
            .map_err(|e| malformed(format!("Failed to determine file size: {}", e)))
    }

    fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<(), LoaderError> {
        reader
            .seek(SeekFrom::Start(offset))
            .and_then(|_| reader.read_exact(buf))
            .map_err(|e| {
                malformed(format!(
                    "Failed to read {} bytes at offset 0x{:x}: {}",
                    buf.len(),
                    offset,
                    e
                ))
            })
    }

    /// Read `size` bytes of a section after checking it lies within the file
    fn read_section<R: Read + Seek>(
        reader: &mut R,
        shdr: &Elf32Shdr,
        size: u32,
        file_size: u64,
    ) -> Result<Vec<u8>, LoaderError> {
        let end = shdr.sh_offset as u64 + size as u64;
        if end > file_size {
            return Err(malformed(format!(
                "Section at 0x{:x} (0x{:x} bytes) extends beyond file ({} bytes)",
                shdr.sh_offset, size, file_size
            )));
        }

        let mut data = vec![0u8; size as usize];
        Self::read_at(reader, shdr.sh_offset as u64, &mut data)?;
        Ok(data)
    }

    /// Parse ELF header from reader
    pub fn parse_header<R: Read + Seek>(reader: &mut R) -> Result<Elf32Header, LoaderError> {
        let file_size = Self::stream_len(reader)?;

        debug!("Parsing ELF header, file size: {} bytes (0x{:x})", file_size, file_size);

        if file_size < EHDR_SIZE as u64 {
            return Err(malformed(format!(
                "File too small to be a valid ELF: {} bytes (minimum {} bytes required for ELF32 header)",
                file_size, EHDR_SIZE
            )));
        }

        let mut buf = [0u8; EHDR_SIZE];
        Self::read_at(reader, 0, &mut buf)?;

        let mut header = Elf32Header::default();
        header.e_ident.copy_from_slice(&buf[0..16]);

        if header.e_ident[0..4] != ELF_MAGIC {
            let magic_bytes: String = header.e_ident[0..4]
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ");
            return Err(malformed(format!(
                "Invalid ELF magic bytes: {} (expected: 7F 45 4C 46 / \\x7FELF)",
                magic_bytes
            )));
        }

        if header.e_ident[4] != ELFCLASS32 {
            return Err(malformed(format!(
                "Not a 32-bit ELF: class={} (expected: 1 for ELFCLASS32)",
                header.e_ident[4]
            )));
        }

        if header.e_ident[5] != ELFDATA2LSB {
            return Err(malformed(format!(
                "Not little-endian ELF: data encoding={} (expected: 1 for ELFDATA2LSB)",
                header.e_ident[5]
            )));
        }

        header.e_type = le_u16(&buf, 16);
        header.e_machine = le_u16(&buf, 18);
        header.e_version = le_u32(&buf, 20);
        header.e_entry = le_u32(&buf, 24);
        header.e_phoff = le_u32(&buf, 28);
        header.e_shoff = le_u32(&buf, 32);
        header.e_flags = le_u32(&buf, 36);
        header.e_ehsize = le_u16(&buf, 40);
        header.e_phentsize = le_u16(&buf, 42);
        header.e_phnum = le_u16(&buf, 44);
        header.e_shentsize = le_u16(&buf, 46);
        header.e_shnum = le_u16(&buf, 48);
        header.e_shstrndx = le_u16(&buf, 50);

        if header.e_machine != em::ARM {
            return Err(malformed(format!(
                "Unsupported machine: {} (expected: {} for EM_ARM)",
                header.e_machine,
                em::ARM
            )));
        }

        if header.e_type != et::EXEC && header.e_type != et::DYN {
            return Err(malformed(format!(
                "Unsupported object type: {} (expected ET_EXEC or ET_DYN)",
                header.e_type
            )));
        }

        Ok(header)
    }

    /// Parse program headers
    pub fn parse_phdrs<R: Read + Seek>(
        reader: &mut R,
        header: &Elf32Header,
    ) -> Result<Vec<Elf32Phdr>, LoaderError> {
        if header.e_phnum == 0 {
            return Err(malformed("No program headers present"));
        }

        if header.e_phentsize as usize != PHDR_SIZE {
            return Err(malformed(format!(
                "Unexpected program header entry size: {} (expected {})",
                header.e_phentsize, PHDR_SIZE
            )));
        }

        let file_size = Self::stream_len(reader)?;

        debug!(
            "Parsing {} program headers at offset 0x{:x}",
            header.e_phnum, header.e_phoff
        );

        let phtab_end = header.e_phoff as u64 + header.e_phnum as u64 * PHDR_SIZE as u64;
        if phtab_end > file_size {
            return Err(malformed(format!(
                "Program header table extends beyond file: table ends at offset 0x{:x} but file is only {} bytes",
                phtab_end, file_size
            )));
        }

        let mut phdrs = Vec::with_capacity(header.e_phnum as usize);

        for i in 0..header.e_phnum as u64 {
            let mut buf = [0u8; PHDR_SIZE];
            Self::read_at(reader, header.e_phoff as u64 + i * PHDR_SIZE as u64, &mut buf)?;

            phdrs.push(Elf32Phdr {
                p_type: le_u32(&buf, 0),
                p_offset: le_u32(&buf, 4),
                p_vaddr: le_u32(&buf, 8),
                p_paddr: le_u32(&buf, 12),
                p_filesz: le_u32(&buf, 16),
                p_memsz: le_u32(&buf, 20),
                p_flags: le_u32(&buf, 24),
                p_align: le_u32(&buf, 28),
            });
        }

        Ok(phdrs)
    }

    /// Parse section headers
    ///
    /// Section headers are optional for execution; a table that does not
    /// fit in the file is skipped rather than rejected.
    pub fn parse_shdrs<R: Read + Seek>(
        reader: &mut R,
        header: &Elf32Header,
    ) -> Result<Vec<Elf32Shdr>, LoaderError> {
        if header.e_shoff == 0 || header.e_shnum == 0 {
            debug!("No section headers present (e_shoff=0 or e_shnum=0)");
            return Ok(Vec::new());
        }

        if header.e_shentsize as usize != SHDR_SIZE {
            debug!(
                "Unexpected section header entry size {}, skipping section headers",
                header.e_shentsize
            );
            return Ok(Vec::new());
        }

        let file_size = Self::stream_len(reader)?;
        let shtab_end = header.e_shoff as u64 + header.e_shnum as u64 * SHDR_SIZE as u64;
        if shtab_end > file_size {
            debug!(
                "Section header table extends beyond file (ends at 0x{:x}, file is {} bytes), skipping",
                shtab_end, file_size
            );
            return Ok(Vec::new());
        }

        let mut shdrs = Vec::with_capacity(header.e_shnum as usize);

        for i in 0..header.e_shnum as u64 {
            let mut buf = [0u8; SHDR_SIZE];
            Self::read_at(reader, header.e_shoff as u64 + i * SHDR_SIZE as u64, &mut buf)?;

            shdrs.push(Elf32Shdr {
                sh_name: le_u32(&buf, 0),
                sh_type: le_u32(&buf, 4),
                sh_flags: le_u32(&buf, 8),
                sh_addr: le_u32(&buf, 12),
                sh_offset: le_u32(&buf, 16),
                sh_size: le_u32(&buf, 20),
                sh_link: le_u32(&buf, 24),
                sh_info: le_u32(&buf, 28),
                sh_addralign: le_u32(&buf, 32),
                sh_entsize: le_u32(&buf, 36),
            });
        }

        Ok(shdrs)
    }

    /// Parse the dynamic symbol table (falling back to the static one)
    pub fn parse_symbols<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), LoaderError> {
        let symtab_idx = self
            .shdrs
            .iter()
            .position(|sh| sh.sh_type == sht::DYNSYM)
            .or_else(|| self.shdrs.iter().position(|sh| sh.sh_type == sht::SYMTAB));

        let symtab = match symtab_idx {
            Some(idx) => self.shdrs[idx],
            None => {
                debug!("No symbol table found");
                return Ok(());
            }
        };

        let file_size = Self::stream_len(reader)?;

        let strtab_data = match self.shdrs.get(symtab.sh_link as usize) {
            Some(strtab) if strtab.sh_type == sht::STRTAB && strtab.sh_size > 0 => {
                Self::read_section(reader, strtab, strtab.sh_size, file_size)?
            }
            _ => Vec::new(),
        };

        let table_size = symtab.sh_size - symtab.sh_size % SYM_SIZE as u32;
        let table = Self::read_section(reader, &symtab, table_size, file_size)?;
        let num_symbols = table.len() / SYM_SIZE;

        self.symbols.reserve(num_symbols);

        for entry in table.chunks_exact(SYM_SIZE) {
            let st_name = le_u32(entry, 0);
            let st_info = entry[12];

            let name = if st_name > 0 && (st_name as usize) < strtab_data.len() {
                let name_start = st_name as usize;
                let name_end = strtab_data[name_start..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|pos| name_start + pos)
                    .unwrap_or(strtab_data.len());

                String::from_utf8_lossy(&strtab_data[name_start..name_end]).to_string()
            } else {
                String::new()
            };

            self.symbols.push(Symbol {
                name,
                value: le_u32(entry, 4),
                size: le_u32(entry, 8),
                bind: st_info >> 4,
                sym_type: st_info & 0xf,
                section: le_u16(entry, 14),
            });
        }

        debug!("Loaded {} symbols", self.symbols.len());
        Ok(())
    }

    /// Loadable segments in table order
    pub fn loadable_segments(&self) -> impl Iterator<Item = (usize, &Elf32Phdr)> {
        self.phdrs
            .iter()
            .enumerate()
            .filter(|(_, phdr)| phdr.p_type == pt::LOAD && phdr.p_memsz > 0)
    }

    /// Offset one past the last byte that belongs to the ELF image
    ///
    /// Anything between this offset and the tag block is the appended
    /// resource blob.
    pub fn file_extent(&self) -> u64 {
        let mut end = EHDR_SIZE as u64;

        end = end.max(self.header.e_phoff as u64 + self.header.e_phnum as u64 * PHDR_SIZE as u64);

        if !self.shdrs.is_empty() {
            end = end.max(self.header.e_shoff as u64 + self.shdrs.len() as u64 * SHDR_SIZE as u64);
        }

        for phdr in &self.phdrs {
            if phdr.p_type != pt::NULL && phdr.p_filesz > 0 {
                end = end.max(phdr.p_offset as u64 + phdr.p_filesz as u64);
            }
        }

        for shdr in &self.shdrs {
            if shdr.sh_type != sht::NULL && shdr.sh_type != sht::NOBITS {
                end = end.max(shdr.sh_offset as u64 + shdr.sh_size as u64);
            }
        }

        end
    }

    /// Copy every planned segment into the region
    ///
    /// The region is freshly zeroed, so BSS needs no extra work.
    pub fn load_segments(
        &self,
        data: &[u8],
        region: &mut ArenaRegion,
        layout: &ImageLayout,
    ) -> Result<(), LoaderError> {
        info!("Loading ELF segments at base address 0x{:08x}", region.base());

        for seg in &layout.segments {
            let dest = region.base() + seg.dest_offset;
            let start = seg.file_offset as usize;
            let bytes = &data[start..start + seg.file_size as usize];

            debug!(
                "Loading segment {}: dest=0x{:08x}, filesz=0x{:x}, memsz=0x{:x}, flags={:?}",
                seg.index, dest, seg.file_size, seg.mem_size, seg.flags
            );

            region.write_bytes(dest, bytes).map_err(|e| {
                malformed(format!(
                    "Failed to write segment {} ({} bytes) to 0x{:08x}: {}",
                    seg.index, seg.file_size, dest, e
                ))
            })?;
        }

        Ok(())
    }

    /// Process REL relocation sections against the loaded image
    pub fn process_relocations(
        &self,
        data: &[u8],
        region: &mut ArenaRegion,
        vaddr_base: u32,
    ) -> Result<usize, LoaderError> {
        let load_bias = region.base().wrapping_sub(vaddr_base);
        let mut applied = 0;

        for shdr in self.shdrs.iter().filter(|sh| sh.sh_type == sht::REL) {
            let start = shdr.sh_offset as usize;
            let end = start + shdr.sh_size as usize;
            let table = data.get(start..end).ok_or_else(|| {
                malformed(format!(
                    "Relocation section at 0x{:x} (+0x{:x}) extends beyond package",
                    shdr.sh_offset, shdr.sh_size
                ))
            })?;

            for entry in table.chunks_exact(REL_SIZE) {
                let r_offset = le_u32(entry, 0);
                let r_info = le_u32(entry, 4);
                let r_type = r_info & 0xff;
                let r_sym = (r_info >> 8) as usize;

                if self.apply_relocation(region, load_bias, r_offset, r_type, r_sym)? {
                    applied += 1;
                }
            }
        }

        if applied > 0 {
            info!("Applied {} relocations (bias 0x{:08x})", applied, load_bias);
        }

        Ok(applied)
    }

    /// Apply a single relocation, returning whether memory was patched
    fn apply_relocation(
        &self,
        region: &mut ArenaRegion,
        load_bias: u32,
        offset: u32,
        rel_type: u32,
        sym_idx: usize,
    ) -> Result<bool, LoaderError> {
        let addr = offset.wrapping_add(load_bias);

        let symbol = self.symbols.get(sym_idx).filter(|sym| sym.is_defined());
        let sym_value = symbol.map(|sym| sym.value.wrapping_add(load_bias));

        trace!(
            "Applying relocation: type={}, addr=0x{:08x}, sym={}",
            rel_type,
            addr,
            sym_idx
        );

        let reloc_err = |e: MemoryError| malformed(format!("Relocation at 0x{:08x} failed: {}", offset, e));

        match rel_type {
            r_arm::NONE => Ok(false),
            r_arm::RELATIVE => {
                // B + A
                let addend = region.read_u32(addr).map_err(reloc_err)?;
                region
                    .write_u32(addr, addend.wrapping_add(load_bias))
                    .map_err(reloc_err)?;
                Ok(true)
            }
            r_arm::ABS32 => {
                // S + A
                let Some(value) = sym_value else {
                    trace!("ABS32 against undefined symbol {}, left for import binding", sym_idx);
                    return Ok(false);
                };
                let addend = region.read_u32(addr).map_err(reloc_err)?;
                region
                    .write_u32(addr, value.wrapping_add(addend))
                    .map_err(reloc_err)?;
                Ok(true)
            }
            r_arm::GLOB_DAT | r_arm::JUMP_SLOT => {
                // S
                let Some(value) = sym_value else {
                    trace!("Slot against undefined symbol {}, left for import binding", sym_idx);
                    return Ok(false);
                };
                region.write_u32(addr, value).map_err(reloc_err)?;
                Ok(true)
            }
            _ => {
                debug!("Unsupported relocation type: {}", rel_type);
                Ok(false)
            }
        }
    }
}
