//! MRE package assembly
//!
//! Produces packages in the layout the loader accepts: ELF header and
//! program headers at the start, segment data at page-congruent offsets,
//! optional dynamic symbol and REL sections, then the resource blob and
//! the tag block with its trailer.

use crate::elf::{
    em, et, pf, pt, sht, ELF_MAGIC, ELFCLASS32, ELFDATA2LSB, EHDR_SIZE, PHDR_SIZE, REL_SIZE,
    SHDR_SIZE, STB_GLOBAL, STT_FUNC, SYM_SIZE,
};
use crate::tags::{tag, TAGS_MAGIC};

const SEGMENT_ALIGN: u32 = 0x1000;

#[derive(Debug, Clone)]
struct SegmentSpec {
    vaddr: u32,
    data: Vec<u8>,
    mem_size: u32,
    flags: u32,
    offset: Option<u32>,
}

#[derive(Debug, Clone)]
struct SymbolSpec {
    name: String,
    value: u32,
    defined: bool,
}

#[derive(Debug, Clone, Copy)]
struct RelocationSpec {
    offset: u32,
    r_type: u32,
    /// Index into the builder's symbols, if any
    symbol: Option<usize>,
}

/// Builder for guest packages
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    machine: u16,
    elf_type: u16,
    entry: u32,
    segments: Vec<SegmentSpec>,
    symbols: Vec<SymbolSpec>,
    relocations: Vec<RelocationSpec>,
    resources: Vec<u8>,
    tags: Vec<(u32, Vec<u8>)>,
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    let rem = buf.len() % align;
    if rem != 0 {
        buf.resize(buf.len() + align - rem, 0);
    }
}

impl PackageBuilder {
    /// Start an ARM executable with no segments
    pub fn new() -> Self {
        Self {
            machine: em::ARM,
            elf_type: et::EXEC,
            entry: 0,
            segments: Vec::new(),
            symbols: Vec::new(),
            relocations: Vec::new(),
            resources: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn elf_type(mut self, elf_type: u16) -> Self {
        self.elf_type = elf_type;
        self
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// Add a read/execute segment whose file and memory sizes match
    pub fn segment(self, vaddr: u32, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let mem_size = data.len() as u32;
        self.segment_with(vaddr, data, mem_size, pf::R | pf::X, None)
    }

    /// Add a segment with explicit memory size, flags and file offset
    ///
    /// When `offset` is `None` the data is placed at the next free offset
    /// congruent to `vaddr` modulo the page size.
    pub fn segment_with(
        mut self,
        vaddr: u32,
        data: impl Into<Vec<u8>>,
        mem_size: u32,
        flags: u32,
        offset: Option<u32>,
    ) -> Self {
        self.segments.push(SegmentSpec {
            vaddr,
            data: data.into(),
            mem_size,
            flags,
            offset,
        });
        self
    }

    /// Add a dynamic symbol; relocations refer to symbols by insertion
    /// order starting at 0
    pub fn symbol(mut self, name: &str, value: u32, defined: bool) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            value,
            defined,
        });
        self
    }

    pub fn relocation(mut self, offset: u32, r_type: u32, symbol: Option<usize>) -> Self {
        self.relocations.push(RelocationSpec {
            offset,
            r_type,
            symbol,
        });
        self
    }

    pub fn resources(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.resources = blob.into();
        self
    }

    pub fn tag(mut self, id: u32, data: impl Into<Vec<u8>>) -> Self {
        self.tags.push((id, data.into()));
        self
    }

    pub fn tag_u32(self, id: u32, value: u32) -> Self {
        self.tag(id, value.to_le_bytes().to_vec())
    }

    pub fn name(self, name: &str) -> Self {
        let mut data = name.as_bytes().to_vec();
        data.push(0);
        self.tag(tag::NAME, data)
    }

    /// Assemble the package bytes
    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let headers_end = EHDR_SIZE + phnum * PHDR_SIZE;

        // Place segment data
        let mut cursor = headers_end as u32;
        let mut offsets = Vec::with_capacity(phnum);
        for seg in &self.segments {
            let offset = match seg.offset {
                Some(offset) => offset,
                None => {
                    let page_start = cursor.div_ceil(SEGMENT_ALIGN) * SEGMENT_ALIGN;
                    page_start + seg.vaddr % SEGMENT_ALIGN
                }
            };
            cursor = cursor.max(offset + seg.data.len() as u32);
            offsets.push(offset);
        }

        let mut out = vec![0u8; cursor as usize];
        for (seg, &offset) in self.segments.iter().zip(&offsets) {
            let start = offset as usize;
            out[start..start + seg.data.len()].copy_from_slice(&seg.data);
        }

        let (shoff, shnum) = if self.symbols.is_empty() && self.relocations.is_empty() {
            (0, 0)
        } else {
            self.append_dynamic_sections(&mut out)
        };

        self.write_headers(&mut out, &offsets, shoff, shnum);

        out.extend_from_slice(&self.resources);
        self.append_tags(&mut out);
        out
    }

    fn write_headers(&self, out: &mut [u8], offsets: &[u32], shoff: u32, shnum: u16) {
        out[0..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS32;
        out[5] = ELFDATA2LSB;
        out[6] = 1; // EV_CURRENT
        out[7..16].fill(0);
        put_u16(out, 16, self.elf_type);
        put_u16(out, 18, self.machine);
        put_u32(out, 20, 1);
        put_u32(out, 24, self.entry);
        put_u32(out, 28, EHDR_SIZE as u32);
        put_u32(out, 32, shoff);
        put_u32(out, 36, 0x0500_0000); // EABI v5
        put_u16(out, 40, EHDR_SIZE as u16);
        put_u16(out, 42, PHDR_SIZE as u16);
        put_u16(out, 44, self.segments.len() as u16);
        put_u16(out, 46, SHDR_SIZE as u16);
        put_u16(out, 48, shnum);
        put_u16(out, 50, 0);

        for (i, (seg, &offset)) in self.segments.iter().zip(offsets).enumerate() {
            let base = EHDR_SIZE + i * PHDR_SIZE;
            let align = if offset % SEGMENT_ALIGN == seg.vaddr % SEGMENT_ALIGN {
                SEGMENT_ALIGN
            } else {
                1
            };
            put_u32(out, base, pt::LOAD);
            put_u32(out, base + 4, offset);
            put_u32(out, base + 8, seg.vaddr);
            put_u32(out, base + 12, seg.vaddr);
            put_u32(out, base + 16, seg.data.len() as u32);
            put_u32(out, base + 20, seg.mem_size);
            put_u32(out, base + 24, seg.flags);
            put_u32(out, base + 28, align);
        }
    }

    /// Append `.dynsym`, `.dynstr` and `.rel.dyn` plus the section header
    /// table, returning its offset and entry count
    fn append_dynamic_sections(&self, out: &mut Vec<u8>) -> (u32, u16) {
        pad_to(out, 4);

        // .dynstr
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::with_capacity(self.symbols.len());
        for sym in &self.symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }
        let strtab_off = out.len() as u32;
        out.extend_from_slice(&strtab);
        pad_to(out, 4);

        // .dynsym, entry 0 is the null symbol
        let symtab_off = out.len() as u32;
        out.resize(out.len() + SYM_SIZE, 0);
        for (sym, &name) in self.symbols.iter().zip(&name_offsets) {
            let mut entry = [0u8; SYM_SIZE];
            put_u32(&mut entry, 0, name);
            put_u32(&mut entry, 4, sym.value);
            entry[12] = (STB_GLOBAL << 4) | STT_FUNC;
            put_u16(&mut entry, 14, if sym.defined { 1 } else { 0 });
            out.extend_from_slice(&entry);
        }
        let symtab_size = ((self.symbols.len() + 1) * SYM_SIZE) as u32;

        // .rel.dyn
        let rel_off = out.len() as u32;
        for rel in &self.relocations {
            let sym = rel.symbol.map(|idx| idx as u32 + 1).unwrap_or(0);
            let mut entry = [0u8; REL_SIZE];
            put_u32(&mut entry, 0, rel.offset);
            put_u32(&mut entry, 4, (sym << 8) | (rel.r_type & 0xff));
            out.extend_from_slice(&entry);
        }
        let rel_size = (self.relocations.len() * REL_SIZE) as u32;

        let shoff = out.len() as u32;
        let sections = [
            // (type, offset, size, link, entsize)
            (sht::NULL, 0, 0, 0, 0),
            (sht::DYNSYM, symtab_off, symtab_size, 2, SYM_SIZE as u32),
            (sht::STRTAB, strtab_off, strtab.len() as u32, 0, 0),
            (sht::REL, rel_off, rel_size, 1, REL_SIZE as u32),
        ];
        for (sh_type, offset, size, link, entsize) in sections {
            let mut entry = [0u8; SHDR_SIZE];
            put_u32(&mut entry, 4, sh_type);
            put_u32(&mut entry, 16, offset);
            put_u32(&mut entry, 20, size);
            put_u32(&mut entry, 24, link);
            put_u32(&mut entry, 32, 4);
            put_u32(&mut entry, 36, entsize);
            out.extend_from_slice(&entry);
        }

        (shoff, sections.len() as u16)
    }

    fn append_tags(&self, out: &mut Vec<u8>) {
        if self.tags.is_empty() {
            return;
        }

        let block_offset = out.len() as u32;
        for (id, data) in &self.tags {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        out.extend_from_slice(&tag::END.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        let block_len = out.len() as u32 - block_offset;
        out.extend_from_slice(&block_offset.to_le_bytes());
        out.extend_from_slice(&block_len.to_le_bytes());
        out.extend_from_slice(&TAGS_MAGIC);
    }
}
