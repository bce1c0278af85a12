//! Non-volatile memory device abstraction
//!
//! Devices are addressed by byte offset and erased a whole block at a time.
//! Writes never erase: on NOR-style media a write can only clear bits, so
//! the file system erases a block before reusing any of its pages.
//!
//! Three backends are provided:
//! - [`RamDevice`] - in-memory NOR model, used by tests and benches
//! - [`FileDevice`] - image file on the host file system
//! - [`ScriptedDevice`] - wraps another device and injects scripted failures

pub mod file;
pub mod ram;
pub mod scripted;

pub use file::FileDevice;
pub use ram::RamDevice;
pub use scripted::{FaultScript, Op, ScriptedDevice, Scripted};

use crate::error::{DeviceError, FsError, Result};
use serde::{Deserialize, Serialize};

/// Value of every byte after an erase.
pub const ERASED: u8 = 0xFF;

/// Physical layout of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Bytes per page (the allocation unit)
    pub page_size: u32,

    /// Pages per erase block
    pub pages_per_block: u32,

    /// Number of erase blocks
    pub block_count: u32,
}

impl Geometry {
    pub const fn new(page_size: u32, pages_per_block: u32, block_count: u32) -> Self {
        Geometry {
            page_size,
            pages_per_block,
            block_count,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.page_size * self.pages_per_block
    }

    pub fn total_pages(&self) -> u32 {
        self.pages_per_block * self.block_count
    }

    pub fn capacity(&self) -> u64 {
        self.block_size() as u64 * self.block_count as u64
    }

    /// Byte address of a page.
    pub fn page_addr(&self, page: u32) -> u32 {
        page * self.page_size
    }

    /// Byte address of the first page of a block.
    pub fn block_addr(&self, block: u32) -> u32 {
        block * self.block_size()
    }

    pub fn block_of(&self, page: u32) -> u32 {
        page / self.pages_per_block
    }

    /// Check the constraints every mounted geometry must satisfy.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(64..=65536).contains(&self.page_size) {
            return Err(FsError::Config(format!(
                "page size {} must be a power of two between 64 and 65536",
                self.page_size
            )));
        }
        if !(2..=1024).contains(&self.pages_per_block) {
            return Err(FsError::Config(format!(
                "pages per block {} must be between 2 and 1024",
                self.pages_per_block
            )));
        }
        if self.block_count < 4 {
            return Err(FsError::Config(format!(
                "block count {} is below the minimum of 4",
                self.block_count
            )));
        }
        if self.capacity() > u32::MAX as u64 {
            return Err(FsError::Config(format!(
                "device capacity {} exceeds the 32-bit address space",
                self.capacity()
            )));
        }
        Ok(())
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry::new(256, 16, 64)
    }
}

/// Block-level access to a raw NVM device
///
/// All operations are synchronous and never retried by the implementation.
/// Failures are reported immediately so the caller can retire the page or
/// block involved.
pub trait NvmDevice: Send {
    /// Device layout. Must not change over the device's lifetime.
    fn geometry(&self) -> Geometry;

    /// Prepare the device for access. Idempotent.
    fn init(&mut self) -> std::result::Result<(), DeviceError> {
        Ok(())
    }

    /// Driver hook invoked when a file system is mounted on the device.
    fn mount(&mut self) -> std::result::Result<(), DeviceError> {
        Ok(())
    }

    /// Driver hook invoked before a file system is formatted onto the device.
    fn format(&mut self) -> std::result::Result<(), DeviceError> {
        Ok(())
    }

    /// Read `dst.len()` bytes starting at `addr`. Returns the byte count.
    fn read(&mut self, addr: u32, dst: &mut [u8]) -> std::result::Result<usize, DeviceError>;

    /// Program `src` at `addr`. Returns the byte count.
    fn write(&mut self, addr: u32, src: &[u8]) -> std::result::Result<usize, DeviceError>;

    /// Fill all of `dst` from `addr`. A short read is an error.
    fn read_exact(&mut self, addr: u32, dst: &mut [u8]) -> std::result::Result<(), DeviceError> {
        let n = self.read(addr, dst)?;
        if n != dst.len() {
            return Err(DeviceError::ShortRead {
                addr,
                expected: dst.len(),
                got: n,
            });
        }
        Ok(())
    }

    /// Reset every byte of `block` to [`ERASED`].
    fn erase(&mut self, block: u32) -> std::result::Result<(), DeviceError>;
}

impl<D: NvmDevice + ?Sized> NvmDevice for Box<D> {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    fn init(&mut self) -> std::result::Result<(), DeviceError> {
        (**self).init()
    }

    fn mount(&mut self) -> std::result::Result<(), DeviceError> {
        (**self).mount()
    }

    fn format(&mut self) -> std::result::Result<(), DeviceError> {
        (**self).format()
    }

    fn read(&mut self, addr: u32, dst: &mut [u8]) -> std::result::Result<usize, DeviceError> {
        (**self).read(addr, dst)
    }

    fn write(&mut self, addr: u32, src: &[u8]) -> std::result::Result<usize, DeviceError> {
        (**self).write(addr, src)
    }

    fn erase(&mut self, block: u32) -> std::result::Result<(), DeviceError> {
        (**self).erase(block)
    }
}

/// Bounds check shared by the backends.
pub(crate) fn check_range(
    geometry: &Geometry,
    addr: u32,
    len: usize,
) -> std::result::Result<(), DeviceError> {
    let end = addr as u64 + len as u64;
    if end > geometry.capacity() {
        return Err(DeviceError::OutOfBounds { addr, len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_addressing() {
        let geo = Geometry::new(256, 16, 8);
        assert_eq!(geo.block_size(), 4096);
        assert_eq!(geo.total_pages(), 128);
        assert_eq!(geo.page_addr(17), 17 * 256);
        assert_eq!(geo.block_addr(2), 8192);
        assert_eq!(geo.block_of(17), 1);
    }

    #[test]
    fn test_geometry_validation() {
        assert!(Geometry::default().validate().is_ok());
        assert!(Geometry::new(100, 16, 8).validate().is_err());
        assert!(Geometry::new(256, 1, 8).validate().is_err());
        assert!(Geometry::new(256, 16, 3).validate().is_err());
    }

    #[test]
    fn test_check_range() {
        let geo = Geometry::new(64, 2, 4);
        assert!(check_range(&geo, 0, 512).is_ok());
        assert!(matches!(
            check_range(&geo, 500, 13),
            Err(DeviceError::OutOfBounds { .. })
        ));
    }
}
