//! File-backed NVM device
//!
//! Stores a raw flash image in a host file. The image has no header of its
//! own: byte `n` of the file is byte `n` of the device.

use super::{check_range, Geometry, NvmDevice, ERASED};
use crate::error::{DeviceError, FsError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Disk-backed flash image
pub struct FileDevice {
    file: File,
    path: PathBuf,
    geometry: Geometry,
}

impl FileDevice {
    /// Create a new, fully erased image file (truncating any existing one)
    pub fn create<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let block = vec![ERASED; geometry.block_size() as usize];
        for _ in 0..geometry.block_count {
            file.write_all(&block)?;
        }
        file.flush()?;

        Ok(FileDevice {
            file,
            path: path.as_ref().to_path_buf(),
            geometry,
        })
    }

    /// Open an existing image file
    ///
    /// The file length must match the capacity of `geometry`.
    pub fn open<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len != geometry.capacity() {
            return Err(FsError::Config(format!(
                "image {:?} is {} bytes, geometry expects {}",
                path.as_ref(),
                len,
                geometry.capacity()
            )));
        }

        Ok(FileDevice {
            file,
            path: path.as_ref().to_path_buf(),
            geometry,
        })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl NvmDevice for FileDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn init(&mut self) -> std::result::Result<(), DeviceError> {
        let len = self.file.metadata()?.len();
        if len != self.geometry.capacity() {
            return Err(DeviceError::Unreachable);
        }
        Ok(())
    }

    fn read(&mut self, addr: u32, dst: &mut [u8]) -> std::result::Result<usize, DeviceError> {
        check_range(&self.geometry, addr, dst.len())?;
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.read_exact(dst)?;
        Ok(dst.len())
    }

    fn write(&mut self, addr: u32, src: &[u8]) -> std::result::Result<usize, DeviceError> {
        check_range(&self.geometry, addr, src.len())?;

        // Program like NOR flash: bits only go from 1 to 0
        let mut current = vec![0u8; src.len()];
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.read_exact(&mut current)?;
        for (cell, &byte) in current.iter_mut().zip(src) {
            *cell &= byte;
        }

        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.write_all(&current)?;
        self.file.flush()?;
        Ok(src.len())
    }

    fn erase(&mut self, block: u32) -> std::result::Result<(), DeviceError> {
        if block >= self.geometry.block_count {
            return Err(DeviceError::InvalidBlock(block));
        }
        let erased = vec![ERASED; self.geometry.block_size() as usize];
        self.file
            .seek(SeekFrom::Start(self.geometry.block_addr(block) as u64))?;
        self.file.write_all(&erased)?;
        self.file.flush()?;
        Ok(())
    }
}
