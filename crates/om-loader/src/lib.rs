//! MRE package loader for oxidized-mre
//!
//! A package is an ARM ELF32 image followed by an opaque resource blob and
//! an optional tag block.

pub mod builder;
pub mod elf;
pub mod image;
pub mod tags;

// Re-export main types
pub use builder::PackageBuilder;
pub use elf::{ElfLoader, Elf32Header, Elf32Phdr, Elf32Shdr, Symbol};
pub use image::{load_image, ImageLayout, LoadOptions, LoadedImage, SegmentFlags, SegmentPlacement};
pub use tags::MreTags;
