//! In-memory NOR flash model

use super::{check_range, Geometry, NvmDevice, ERASED};
use crate::error::DeviceError;

/// RAM-backed device with NOR programming semantics
///
/// A write stores `old & new`, so bits can only be cleared until the block
/// is erased again. Erase counts are tracked per block.
#[derive(Debug, Clone)]
pub struct RamDevice {
    geometry: Geometry,
    data: Vec<u8>,
    erase_counts: Vec<u32>,
}

impl RamDevice {
    /// Create a fully erased device.
    pub fn new(geometry: Geometry) -> Self {
        RamDevice {
            geometry,
            data: vec![ERASED; geometry.capacity() as usize],
            erase_counts: vec![0; geometry.block_count as usize],
        }
    }

    /// Raw view of the whole device.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw view, bypassing programming rules. Used to simulate
    /// corruption in tests.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn erase_counts(&self) -> &[u32] {
        &self.erase_counts
    }
}

impl NvmDevice for RamDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<usize, DeviceError> {
        check_range(&self.geometry, addr, dst.len())?;
        let start = addr as usize;
        dst.copy_from_slice(&self.data[start..start + dst.len()]);
        Ok(dst.len())
    }

    fn write(&mut self, addr: u32, src: &[u8]) -> Result<usize, DeviceError> {
        check_range(&self.geometry, addr, src.len())?;
        let start = addr as usize;
        for (cell, &byte) in self.data[start..start + src.len()].iter_mut().zip(src) {
            *cell &= byte;
        }
        Ok(src.len())
    }

    fn erase(&mut self, block: u32) -> Result<(), DeviceError> {
        if block >= self.geometry.block_count {
            return Err(DeviceError::InvalidBlock(block));
        }
        let size = self.geometry.block_size() as usize;
        let start = block as usize * size;
        self.data[start..start + size].fill(ERASED);
        self.erase_counts[block as usize] += 1;
        Ok(())
    }
}
