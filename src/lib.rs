//! # nvmfs - Power-Loss-Safe Flash File System
//!
//! `nvmfs` gives POSIX-like file semantics (open with create/truncate
//! flags, read, write, seek, close) on top of a raw NVM block device that
//! can only be programmed page by page and erased block by block.
//!
//! - **Copy-on-write pages** with a single atomic metadata commit per write
//! - **Crash recovery** at mount: interrupted writes roll back, committed
//!   ones roll forward
//! - **Wear spreading** through round-robin allocation and garbage
//!   collection by stale ratio
//! - **Bad page retirement** on failed programs and erases
//! - **Pluggable devices**: RAM, file-backed and fault-injecting backends
//!
//! ## Quick Start
//!
//! ```rust
//! use nvmfs::{Filesystem, OpenFlags, Result, Whence};
//! use nvmfs::nvm::{Geometry, RamDevice};
//!
//! # fn main() -> Result<()> {
//! let fs = Filesystem::format(RamDevice::new(Geometry::default()))?;
//!
//! let mut file = fs.open(
//!     "fs/story.txt",
//!     OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::READ_WRITE,
//! )?;
//! file.write(b"The big bad wolf.")?;
//! file.seek(0, Whence::Set)?;
//!
//! let mut buf = [0u8; 17];
//! assert_eq!(file.read(&mut buf)?, 17);
//! file.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use nvmfs::{FsBuilder, OpenFlags, Result};
//!
//! # fn main() -> Result<()> {
//! let fs = FsBuilder::new()
//!     .page_size(128)
//!     .pages_per_block(8)
//!     .block_count(32)
//!     .cache_pages(16)
//!     .format_ram()?;
//!
//! fs.open("counter", OpenFlags::CREATE | OpenFlags::WRITE)?;
//! assert_eq!(fs.list().len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod buffer_pool;
pub mod catalog;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod gc;
pub mod header;
pub mod mount;
pub mod nvm;
pub mod page;
pub mod vfs;

pub use config::FsConfig;
pub use error::{DeviceError, FsError, Result};
pub use filesystem::{Filesystem, FsStats, ObjectStat};
pub use gc::GcReport;
pub use nvm::{Geometry, NvmDevice};
pub use vfs::{File, OpenFlags, Whence};

use nvm::{FileDevice, RamDevice};
use std::path::Path;
use tracing::{debug, info};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builder for configuring and mounting a file system
///
/// # Examples
///
/// ```rust,no_run
/// use nvmfs::{FsBuilder, Result};
///
/// # fn main() -> Result<()> {
/// let fs = FsBuilder::from_toml_file("nvmfs.toml")?
///     .max_name_len(64)
///     .mount_or_format_file("flash.img")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct FsBuilder {
    config: FsConfig,
}

impl FsBuilder {
    /// Create a new FsBuilder with default settings
    pub fn new() -> Self {
        FsBuilder {
            config: FsConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn with_config(config: FsConfig) -> Self {
        FsBuilder { config }
    }

    /// Start from a TOML configuration file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(FsBuilder {
            config: FsConfig::from_file(path)?,
        })
    }

    /// Take the geometry from an existing device
    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.config.page_size = geometry.page_size;
        self.config.pages_per_block = geometry.pages_per_block;
        self.config.block_count = geometry.block_count;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn pages_per_block(mut self, pages_per_block: u32) -> Self {
        self.config.pages_per_block = pages_per_block;
        self
    }

    pub fn block_count(mut self, block_count: u32) -> Self {
        self.config.block_count = block_count;
        self
    }

    /// Free page count that triggers garbage collection
    pub fn gc_low_water(mut self, pages: u32) -> Self {
        self.config.gc_low_water = Some(pages);
        self
    }

    /// Page payloads kept in the read cache (0 disables it)
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.config.cache_pages = pages;
        self
    }

    pub fn max_name_len(mut self, len: usize) -> Self {
        self.config.max_name_len = len;
        self
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Validate the configuration and hand it out
    pub fn build(self) -> Result<FsConfig> {
        self.config.check()?;
        Ok(self.config)
    }

    /// Mount an already formatted device
    pub fn mount<D: NvmDevice>(self, device: D) -> Result<Filesystem<D>> {
        let config = self.build()?;
        Filesystem::mount_with_config(device, config)
    }

    /// Format a device and mount it
    pub fn format<D: NvmDevice>(self, device: D) -> Result<Filesystem<D>> {
        let config = self.build()?;
        Filesystem::format_with_config(device, config)
    }

    pub fn mount_or_format<D: NvmDevice>(self, device: D) -> Result<Filesystem<D>> {
        let config = self.build()?;
        Filesystem::mount_or_format_with_config(device, config)
    }

    /// Format a fresh in-memory device
    pub fn format_ram(self) -> Result<Filesystem<RamDevice>> {
        let config = self.build()?;
        debug!("Formatting RAM device with {:?}", config.geometry());
        Filesystem::format_with_config(RamDevice::new(config.geometry()), config)
    }

    /// Create an image file and format it
    pub fn format_file<P: AsRef<Path>>(self, path: P) -> Result<Filesystem<FileDevice>> {
        let config = self.build()?;
        info!("Creating image {}", path.as_ref().display());
        let device = FileDevice::create(path, config.geometry())?;
        Filesystem::format_with_config(device, config)
    }

    /// Mount an existing image file
    pub fn mount_file<P: AsRef<Path>>(self, path: P) -> Result<Filesystem<FileDevice>> {
        let config = self.build()?;
        let device = FileDevice::open(path, config.geometry())?;
        Filesystem::mount_with_config(device, config)
    }

    /// Mount an image file, creating and formatting it if needed
    pub fn mount_or_format_file<P: AsRef<Path>>(self, path: P) -> Result<Filesystem<FileDevice>> {
        let config = self.build()?;
        let path = path.as_ref();
        let device = if path.exists() {
            FileDevice::open(path, config.geometry())?
        } else {
            info!("Creating image {}", path.display());
            FileDevice::create(path, config.geometry())?
        };
        Filesystem::mount_or_format_with_config(device, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_builder_rejects_bad_geometry() {
        let result = FsBuilder::new().page_size(100).format_ram();
        assert!(matches!(result, Err(FsError::Config(_))));
    }

    #[test]
    fn test_builder_ram_round_trip() {
        let fs = FsBuilder::new()
            .page_size(64)
            .pages_per_block(4)
            .block_count(8)
            .format_ram()
            .unwrap();

        let mut file = fs
            .open("a", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        file.write(b"builder").unwrap();
        file.close().unwrap();

        let device = fs.unmount().unwrap();
        let fs = FsBuilder::new().geometry(device.geometry()).mount(device).unwrap();
        assert_eq!(fs.stat("a").unwrap().size, 7);
    }

    #[test]
    fn test_builder_file_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.img");
        let builder = FsBuilder::new().page_size(64).pages_per_block(4).block_count(8);

        let fs = builder.clone().mount_or_format_file(&path).unwrap();
        fs.open("x", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
        drop(fs);

        let fs = builder.mount_file(&path).unwrap();
        assert!(fs.exists("x"));
    }
}
