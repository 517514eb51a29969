//! Resident guest applications

use crate::runtime::ExecutionContext;
use bitflags::bitflags;
use om_audio::AudioBridge;
use om_kernel::{FileBridge, Handle, SocketBridge};
use om_loader::{LoadedImage, MreTags};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Index of an app in the manager's table
pub type AppId = Handle;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AppFlags: u32 {
        /// Launched from the system app directory
        const LOCAL  = 0b001;
        /// Package payload is compressed
        const ZIPPED = 0b010;
        /// Package carries an advertising payload
        const ADS    = 0b100;
    }
}

/// Per-app resource handle tables
pub struct AppResources {
    pub audio: AudioBridge,
    pub files: FileBridge,
    pub sockets: SocketBridge,
}

impl AppResources {
    pub fn new(audio: AudioBridge, files: FileBridge, sockets: SocketBridge) -> Self {
        Self {
            audio,
            files,
            sockets,
        }
    }

    /// Release every open resource, returning how many were released
    pub fn teardown(&self) -> usize {
        let audio = self.audio.stop_all();
        let files = self.files.close_all();
        let sockets = self.sockets.close_all();
        if audio + files + sockets > 0 {
            debug!(
                "Released {} audio channels, {} files, {} sockets",
                audio, files, sockets
            );
        }
        audio + files + sockets
    }
}

impl Drop for AppResources {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A loaded and resident app
pub struct GuestApp {
    package: Vec<u8>,
    path: PathBuf,
    real_path: PathBuf,
    flags: AppFlags,
    image: LoadedImage,
    key_handler: Option<u32>,
    resources: AppResources,
}

impl GuestApp {
    pub fn new(
        package: Vec<u8>,
        path: PathBuf,
        real_path: PathBuf,
        local: bool,
        image: LoadedImage,
        resources: AppResources,
    ) -> Self {
        let mut flags = AppFlags::empty();
        flags.set(AppFlags::LOCAL, local);
        flags.set(AppFlags::ZIPPED, image.tags.zipped);
        flags.set(AppFlags::ADS, image.tags.ads);

        Self {
            package,
            path,
            real_path,
            flags,
            image,
            key_handler: None,
            resources,
        }
    }

    /// Display name: the name tag, else the file stem
    pub fn name(&self) -> String {
        match &self.image.tags.name {
            Some(name) => name.clone(),
            None => self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    pub fn flags(&self) -> AppFlags {
        self.flags
    }

    pub fn tags(&self) -> &MreTags {
        &self.image.tags
    }

    pub fn image(&self) -> &LoadedImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut LoadedImage {
        &mut self.image
    }

    pub fn resources(&self) -> &AppResources {
        &self.resources
    }

    pub fn execution_context(&self) -> ExecutionContext {
        ExecutionContext {
            entry_point: self.image.entry_point(),
            base: self.image.base(),
            mem_size: self.image.mem_size(),
            segments_size: self.image.segments_size(),
        }
    }

    /// Resource blob appended to the package
    pub fn resource_blob(&self) -> &[u8] {
        let start = self.image.resource_offset() as usize;
        let end = start + self.image.resource_size() as usize;
        self.package.get(start..end).unwrap_or(&[])
    }

    pub fn key_handler(&self) -> Option<u32> {
        self.key_handler
    }

    /// Register the guest callback for key events; 0 clears it
    pub fn set_key_handler(&mut self, addr: u32) {
        self.key_handler = (addr != 0).then_some(addr);
    }

    pub fn report(&self, id: AppId) -> AppReport {
        let tags = &self.image.tags;
        AppReport {
            id,
            name: self.name(),
            path: self.path.clone(),
            real_path: self.real_path.clone(),
            local: self.flags.contains(AppFlags::LOCAL),
            zipped: self.flags.contains(AppFlags::ZIPPED),
            ads: self.flags.contains(AppFlags::ADS),
            vendor: tags.vendor.clone(),
            version: tags.version,
            context: self.execution_context(),
            heap_size: self.image.layout.heap_size,
            resource_offset: self.image.resource_offset(),
            resource_size: self.image.resource_size(),
            relocations: self.image.relocations,
        }
    }
}

impl std::fmt::Debug for GuestApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestApp")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("base", &format_args!("0x{:08x}", self.image.base()))
            .field("mem_size", &format_args!("0x{:x}", self.image.mem_size()))
            .finish()
    }
}

/// Diagnostic summary of a resident app
#[derive(Debug, Clone, Serialize)]
pub struct AppReport {
    pub id: AppId,
    pub name: String,
    pub path: PathBuf,
    pub real_path: PathBuf,
    pub local: bool,
    pub zipped: bool,
    pub ads: bool,
    pub vendor: Option<String>,
    pub version: Option<u32>,
    pub context: ExecutionContext,
    pub heap_size: u32,
    pub resource_offset: u32,
    pub resource_size: u32,
    pub relocations: usize,
}
