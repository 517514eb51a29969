//! Guest file handles (vm_file_*)
//!
//! Guest paths use drive letters (`E:\folder\file.dat`). Each letter maps
//! to a host directory from the configuration; paths may not climb out of
//! their drive root.

use crate::handles::{Handle, HandleTable};
use om_core::config::DrivesConfig;
use om_core::error::KernelError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// File open modes
pub mod mode {
    pub const READ: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const CREATE_ALWAYS_WRITE: u32 = 4;
    pub const APPEND: u32 = 8;
}

/// Seek origins
pub mod seek {
    pub const BASE_BEGIN: u32 = 1;
    pub const BASE_CURR: u32 = 2;
    pub const BASE_END: u32 = 3;
}

/// An open guest file
pub struct GuestFile {
    guest_path: String,
    path: PathBuf,
    inner: Mutex<File>,
}

impl GuestFile {
    fn open(guest_path: &str, path: PathBuf, open_mode: u32) -> Result<Self, KernelError> {
        let mut options = OpenOptions::new();

        if open_mode & mode::CREATE_ALWAYS_WRITE != 0 {
            options.read(true).write(true).create(true).truncate(true);
        } else if open_mode & mode::APPEND != 0 {
            options.read(true).append(true).create(true);
        } else if open_mode & mode::WRITE != 0 {
            options.read(true).write(true);
        } else {
            options.read(true);
        }

        let file = options.open(&path)?;

        Ok(Self {
            guest_path: guest_path.to_string(),
            path,
            inner: Mutex::new(file),
        })
    }

    pub fn guest_path(&self) -> &str {
        &self.guest_path
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self, buffer: &mut [u8]) -> Result<usize, KernelError> {
        Ok(self.inner.lock().read(buffer)?)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, KernelError> {
        Ok(self.inner.lock().write(data)?)
    }

    pub fn seek(&self, offset: i64, base: u32) -> Result<u64, KernelError> {
        let from = match base {
            seek::BASE_BEGIN => SeekFrom::Start(
                u64::try_from(offset).map_err(|_| KernelError::Io("Negative seek".into()))?,
            ),
            seek::BASE_CURR => SeekFrom::Current(offset),
            seek::BASE_END => SeekFrom::End(offset),
            _ => return Err(KernelError::Io(format!("Invalid seek base {}", base))),
        };
        Ok(self.inner.lock().seek(from)?)
    }

    pub fn tell(&self) -> Result<u64, KernelError> {
        Ok(self.inner.lock().stream_position()?)
    }

    pub fn size(&self) -> Result<u64, KernelError> {
        Ok(self.inner.lock().metadata()?.len())
    }

    fn flush(&self) {
        if let Err(e) = self.inner.lock().flush() {
            debug!("Flush of {} failed: {}", self.guest_path, e);
        }
    }
}

/// Per-app table of open files
pub struct FileBridge {
    drives: DrivesConfig,
    files: HandleTable<GuestFile>,
}

impl FileBridge {
    pub fn new(drives: DrivesConfig, max_files: usize) -> Self {
        Self {
            drives,
            files: HandleTable::with_limit("file", max_files),
        }
    }

    /// Map a guest path to a host path under its drive root
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, KernelError> {
        let mut chars = guest_path.chars();
        let (letter, colon) = (chars.next(), chars.next());
        let letter = match (letter, colon) {
            (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => letter,
            _ => {
                return Err(KernelError::Io(format!(
                    "Path without drive letter: {}",
                    guest_path
                )))
            }
        };

        let root = self
            .drives
            .root_for(letter)
            .ok_or_else(|| KernelError::Io(format!("Unknown drive {}:", letter)))?;

        let mut path = root.to_path_buf();
        for part in guest_path[2..].split(['\\', '/']) {
            match part {
                "" | "." => {}
                ".." => {
                    debug!("Rejected guest path {}", guest_path);
                    return Err(KernelError::PermissionDenied);
                }
                name if name.contains(':') => return Err(KernelError::PermissionDenied),
                name => path.push(name),
            }
        }

        Ok(path)
    }

    /// Open a file, returning its handle
    pub fn open(&self, guest_path: &str, open_mode: u32) -> Result<Handle, KernelError> {
        let path = self.resolve(guest_path)?;
        let file = GuestFile::open(guest_path, path, open_mode)?;
        let handle = self.files.push(file)?;
        debug!("Opened {} as file handle {}", guest_path, handle);
        Ok(handle)
    }

    pub fn read(&self, handle: Handle, buffer: &mut [u8]) -> Result<usize, KernelError> {
        self.files.access(handle)?.read(buffer)
    }

    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<usize, KernelError> {
        self.files.access(handle)?.write(data)
    }

    pub fn seek(&self, handle: Handle, offset: i64, base: u32) -> Result<u64, KernelError> {
        self.files.access(handle)?.seek(offset, base)
    }

    pub fn tell(&self, handle: Handle) -> Result<u64, KernelError> {
        self.files.access(handle)?.tell()
    }

    pub fn size(&self, handle: Handle) -> Result<u64, KernelError> {
        self.files.access(handle)?.size()
    }

    pub fn is_open(&self, handle: Handle) -> bool {
        self.files.is_active(handle)
    }

    /// Close a file; closing an inactive handle is an error
    pub fn close(&self, handle: Handle) -> Result<(), KernelError> {
        let file = self
            .files
            .remove(handle)
            .ok_or(KernelError::InvalidHandle(handle))?;
        file.flush();
        trace!("Closed file handle {} ({})", handle, file.guest_path);
        Ok(())
    }

    /// Close every open file, returning how many were open
    pub fn close_all(&self) -> usize {
        let files = self.files.reset_all();
        for file in &files {
            file.flush();
        }
        files.len()
    }

    pub fn open_count(&self) -> usize {
        self.files.active_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn bridge(dir: &TempDir, max_files: usize) -> FileBridge {
        let mut roots = BTreeMap::new();
        roots.insert("E".to_string(), dir.path().to_path_buf());
        FileBridge::new(DrivesConfig { roots }, max_files)
    }

    #[test]
    fn test_resolve_paths() {
        let dir = TempDir::new().unwrap();
        let files = bridge(&dir, 4);

        assert_eq!(
            files.resolve("e:\\games\\save.dat").unwrap(),
            dir.path().join("games").join("save.dat")
        );
        assert_eq!(files.resolve("E:/a/./b").unwrap(), dir.path().join("a").join("b"));
        assert_eq!(
            files.resolve("E:\\..\\etc\\passwd").unwrap_err(),
            KernelError::PermissionDenied
        );
        assert!(matches!(files.resolve("C:\\x"), Err(KernelError::Io(_))));
        assert!(matches!(files.resolve("save.dat"), Err(KernelError::Io(_))));
    }

    #[test]
    fn test_write_seek_read() {
        let dir = TempDir::new().unwrap();
        let files = bridge(&dir, 4);

        let h = files.open("E:\\score.bin", mode::CREATE_ALWAYS_WRITE).unwrap();
        assert_eq!(files.write(h, b"hello world").unwrap(), 11);
        assert_eq!(files.tell(h).unwrap(), 11);
        assert_eq!(files.size(h).unwrap(), 11);

        assert_eq!(files.seek(h, 6, seek::BASE_BEGIN).unwrap(), 6);
        let mut buf = [0u8; 5];
        assert_eq!(files.read(h, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        assert_eq!(files.seek(h, -5, seek::BASE_END).unwrap(), 6);
        assert!(files.seek(h, 0, 9).is_err());

        files.close(h).unwrap();
        assert!(!files.is_open(h));
        assert_eq!(files.close(h), Err(KernelError::InvalidHandle(h)));
        assert!(files.read(h, &mut buf).is_err());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let files = bridge(&dir, 4);
        assert!(files.open("E:\\missing.txt", mode::READ).is_err());
        assert_eq!(files.open_count(), 0);
    }

    #[test]
    fn test_limit_and_close_all() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let files = bridge(&dir, 2);

        let h0 = files.open("E:\\a.txt", mode::READ).unwrap();
        let h1 = files.open("E:\\a.txt", mode::READ).unwrap();
        assert_eq!((h0, h1), (0, 1));
        assert_eq!(
            files.open("E:\\a.txt", mode::READ),
            Err(KernelError::ResourceLimit)
        );

        assert_eq!(files.close_all(), 2);
        assert!(!files.is_open(h0));
        assert!(!files.is_open(h1));
    }
}
