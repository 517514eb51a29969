//! Audio source identity
//!
//! A play request for a source that already has a live channel restarts
//! that channel in place. Buffers are identified by guest address, length
//! and a SHA-1 of their contents, so a buffer rewritten in place with new
//! data counts as a new source.

use sha1::{Digest, Sha1};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    File(PathBuf),
    Buffer { addr: u32, len: u32, digest: [u8; 20] },
}

impl SourceKey {
    pub fn file(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }

    pub fn buffer(addr: u32, data: &[u8]) -> Self {
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&Sha1::digest(data));
        Self::Buffer {
            addr,
            len: data.len() as u32,
            digest,
        }
    }
}

impl fmt::Debug for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "File({})", path.display()),
            Self::Buffer { addr, len, digest } => write!(
                f,
                "Buffer(0x{:08x}+0x{:x}, {:02x}{:02x}{:02x}{:02x}..)",
                addr, len, digest[0], digest[1], digest[2], digest[3]
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_identity() {
        let a = SourceKey::buffer(0x1000, b"MThd....");
        assert_eq!(a, SourceKey::buffer(0x1000, b"MThd...."));
        assert_ne!(a, SourceKey::buffer(0x2000, b"MThd...."));
        assert_ne!(a, SourceKey::buffer(0x1000, b"MThd...!"));
        assert_ne!(a, SourceKey::file(Path::new("E:\\a.mid")));
    }

    #[test]
    fn test_debug_is_compact() {
        let key = SourceKey::buffer(0x1000, b"abc");
        let text = format!("{:?}", key);
        assert!(text.starts_with("Buffer(0x00001000+0x3, a999"));
    }
}
