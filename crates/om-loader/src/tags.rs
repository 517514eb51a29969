//! MRE package tag block
//!
//! A package may end with a block of `(id, len, data)` records describing
//! the app. The block is located through a 12-byte trailer at the very end
//! of the package:
//!
//! ```text
//! [ tags_offset: u32 LE ][ tags_len: u32 LE ][ "MRET" ]
//! ```
//!
//! Packages without the trailer simply carry no tags.

use om_core::error::LoaderError;
use serde::Serialize;
use tracing::{debug, trace};

/// Trailer magic
pub const TAGS_MAGIC: [u8; 4] = *b"MRET";

/// Size of the trailer that locates the tag block
pub const TRAILER_SIZE: usize = 12;

/// Size of a tag record header (id + length)
pub const TAG_HEADER_SIZE: usize = 8;

/// Known tag identifiers
pub mod tag {
    pub const END: u32 = 0x00;
    pub const NAME: u32 = 0x01;
    pub const VENDOR: u32 = 0x02;
    pub const VERSION: u32 = 0x03;
    /// Heap reservation in KiB
    pub const RAM_KB: u32 = 0x0F;
    /// Size of the appended resource blob
    pub const RESOURCE_SIZE: u32 = 0x10;
    pub const ADS: u32 = 0x11;
    pub const ZIPPED: u32 = 0x12;
}

/// Parsed tag block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MreTags {
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub version: Option<u32>,
    pub ram_kb: Option<u32>,
    pub resource_size: Option<u32>,
    pub ads: bool,
    pub zipped: bool,
    /// Package offset where the tag block starts, if present
    pub block_offset: Option<u64>,
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn malformed(msg: impl Into<String>) -> LoaderError {
    LoaderError::MalformedImage(msg.into())
}

fn tag_u32(id: u32, data: &[u8]) -> Result<u32, LoaderError> {
    if data.len() < 4 {
        return Err(malformed(format!(
            "Tag 0x{:02x} holds {} bytes, expected a 32-bit value",
            id,
            data.len()
        )));
    }
    Ok(le_u32(data, 0))
}

fn tag_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

impl MreTags {
    /// Locate and parse the tag block of a package
    pub fn parse(package: &[u8]) -> Result<Self, LoaderError> {
        let Some(trailer_start) = package.len().checked_sub(TRAILER_SIZE) else {
            return Ok(Self::default());
        };
        let trailer = &package[trailer_start..];
        if trailer[8..12] != TAGS_MAGIC {
            trace!("No tag trailer present");
            return Ok(Self::default());
        }

        let offset = le_u32(trailer, 0) as usize;
        let len = le_u32(trailer, 4) as usize;
        if offset.checked_add(len) != Some(trailer_start) {
            return Err(malformed(format!(
                "Tag block at 0x{:x} (+0x{:x}) does not end at the trailer (0x{:x})",
                offset, len, trailer_start
            )));
        }

        let mut tags = Self {
            block_offset: Some(offset as u64),
            ..Self::default()
        };

        let block = &package[offset..trailer_start];
        let mut cursor = 0usize;

        while cursor + TAG_HEADER_SIZE <= block.len() {
            let id = le_u32(block, cursor);
            let size = le_u32(block, cursor + 4) as usize;
            cursor += TAG_HEADER_SIZE;

            if id == tag::END {
                break;
            }

            let data = block.get(cursor..cursor + size).ok_or_else(|| {
                malformed(format!(
                    "Tag 0x{:02x} at block offset 0x{:x} claims {} bytes past the block end",
                    id,
                    cursor - TAG_HEADER_SIZE,
                    size
                ))
            })?;
            cursor += size;

            match id {
                tag::NAME => tags.name = Some(tag_string(data)),
                tag::VENDOR => tags.vendor = Some(tag_string(data)),
                tag::VERSION => tags.version = Some(tag_u32(id, data)?),
                tag::RAM_KB => tags.ram_kb = Some(tag_u32(id, data)?),
                tag::RESOURCE_SIZE => tags.resource_size = Some(tag_u32(id, data)?),
                tag::ADS => tags.ads = tag_u32(id, data)? != 0,
                tag::ZIPPED => tags.zipped = tag_u32(id, data)? != 0,
                _ => trace!("Skipping unknown tag 0x{:02x} ({} bytes)", id, size),
            }
        }

        debug!(
            "Parsed tags: name={:?}, ram_kb={:?}, resource_size={:?}",
            tags.name, tags.ram_kb, tags.resource_size
        );

        Ok(tags)
    }

    /// Heap reservation declared by the app, in bytes
    pub fn heap_size(&self) -> Option<u32> {
        self.ram_kb.and_then(|kb| kb.checked_mul(1024))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32, data: &[u8]) -> Vec<u8> {
        let mut out = id.to_le_bytes().to_vec();
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    fn package_with(block: &[u8]) -> Vec<u8> {
        let mut pkg = vec![0xEEu8; 32];
        let offset = pkg.len() as u32;
        pkg.extend_from_slice(block);
        pkg.extend_from_slice(&offset.to_le_bytes());
        pkg.extend_from_slice(&(block.len() as u32).to_le_bytes());
        pkg.extend_from_slice(&TAGS_MAGIC);
        pkg
    }

    #[test]
    fn test_no_trailer() {
        assert_eq!(MreTags::parse(&[0u8; 64]).unwrap(), MreTags::default());
        assert_eq!(MreTags::parse(&[]).unwrap(), MreTags::default());
    }

    #[test]
    fn test_parse_known_tags() {
        let mut block = record(tag::NAME, b"Snake\0\0");
        block.extend(record(tag::RAM_KB, &64u32.to_le_bytes()));
        block.extend(record(tag::ZIPPED, &1u32.to_le_bytes()));
        block.extend(record(0x7F, b"ignored"));
        block.extend(record(tag::END, &[]));

        let tags = MreTags::parse(&package_with(&block)).unwrap();
        assert_eq!(tags.name.as_deref(), Some("Snake"));
        assert_eq!(tags.heap_size(), Some(64 * 1024));
        assert!(tags.zipped);
        assert!(!tags.ads);
        assert_eq!(tags.block_offset, Some(32));
    }

    #[test]
    fn test_truncated_record() {
        let mut block = record(tag::VENDOR, b"acme");
        block.truncate(block.len() - 2);

        let err = MreTags::parse(&package_with(&block)).unwrap_err();
        assert!(matches!(err, LoaderError::MalformedImage(_)));
    }

    #[test]
    fn test_short_numeric_tag() {
        let block = record(tag::RAM_KB, &[1, 2]);
        assert!(MreTags::parse(&package_with(&block)).is_err());
    }

    #[test]
    fn test_trailer_offset_mismatch() {
        let mut pkg = package_with(&record(tag::NAME, b"x"));
        let len = pkg.len();
        pkg[len - 12..len - 8].copy_from_slice(&1u32.to_le_bytes());
        assert!(MreTags::parse(&pkg).is_err());
    }
}
