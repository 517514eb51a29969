//! Package retrieval

use crate::events::LaunchRequest;
use om_core::config::AppsConfig;
use om_core::error::LoaderError;
use std::path::PathBuf;
use tracing::debug;

/// Raw package contents plus where they came from
#[derive(Debug, Clone)]
pub struct Package {
    pub bytes: Vec<u8>,
    /// Host path the bytes were read from
    pub real_path: PathBuf,
}

/// Supplies package bytes for launch requests
pub trait PackageSource: Send + Sync {
    fn fetch(&self, request: &LaunchRequest) -> Result<Package, LoaderError>;
}

/// Reads packages from the host file system
///
/// Local launches resolve against the system app directory, other
/// relative paths against the user app directory.
#[derive(Debug, Clone)]
pub struct FsPackageSource {
    system_dir: PathBuf,
    user_dir: PathBuf,
}

impl FsPackageSource {
    pub fn new(config: &AppsConfig) -> Self {
        Self {
            system_dir: config.system_dir.clone(),
            user_dir: config.user_dir.clone(),
        }
    }

    pub fn resolve(&self, request: &LaunchRequest) -> PathBuf {
        if request.local {
            self.system_dir.join(&request.path)
        } else if request.path.is_absolute() {
            request.path.clone()
        } else {
            self.user_dir.join(&request.path)
        }
    }
}

impl PackageSource for FsPackageSource {
    fn fetch(&self, request: &LaunchRequest) -> Result<Package, LoaderError> {
        let real_path = self.resolve(request);
        let bytes = std::fs::read(&real_path)
            .map_err(|e| LoaderError::Io(format!("{}: {}", real_path.display(), e)))?;
        debug!("Read package {} ({} bytes)", real_path.display(), bytes.len());
        Ok(Package { bytes, real_path })
    }
}
