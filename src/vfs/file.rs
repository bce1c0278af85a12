//! Open file handle

use super::{OpenFlags, Whence};
use crate::error::{FsError, Result};
use crate::filesystem::FsState;
use crate::nvm::NvmDevice;
use parking_lot::Mutex;
use std::sync::Arc;

/// Handle on an open object
///
/// Closing consumes the handle, so a closed handle cannot be used again.
/// Dropping a handle closes it too. If the object is truncated or removed
/// through another handle, every call on this one fails with
/// [`FsError::StaleHandle`].
pub struct File<D: NvmDevice> {
    fs: Arc<Mutex<FsState<D>>>,
    id: u32,
    flags: OpenFlags,
    offset: u64,
}

impl<D: NvmDevice> File<D> {
    pub(crate) fn new(fs: Arc<Mutex<FsState<D>>>, id: u32, flags: OpenFlags) -> Self {
        File {
            fs,
            id,
            flags,
            offset: 0,
        }
    }

    /// Object id this handle refers to
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Read from the current offset. Returns 0 at or past the end.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.readable() {
            return Err(FsError::InvalidArgument("handle not open for reading".into()));
        }

        let n = self.fs.lock().read_at(self.id, self.offset, buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Write at the current offset (at the end with `APPEND`)
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.flags.writable() {
            return Err(FsError::InvalidArgument("handle not open for writing".into()));
        }

        let mut state = self.fs.lock();
        if self.flags.contains(OpenFlags::APPEND) {
            self.offset = state.index.live(self.id)?.size;
        }
        let n = state.write_at(self.id, self.offset, buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Move the offset. Seeking past the end is allowed; a later write
    /// fills the gap with zeros.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.offset,
            Whence::End => self.size()?,
        };

        let target = base as i128 + offset as i128;
        if target < 0 || target > u64::MAX as i128 {
            return Err(FsError::InvalidArgument(format!(
                "seek to {} is out of range",
                target
            )));
        }

        self.offset = target as u64;
        Ok(self.offset)
    }

    /// Current offset
    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// Current object size
    pub fn size(&self) -> Result<u64> {
        Ok(self.fs.lock().index.live(self.id)?.size)
    }

    /// Resize the object. The offset is left where it is.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if !self.flags.writable() {
            return Err(FsError::InvalidArgument("handle not open for writing".into()));
        }
        self.fs.lock().truncate(self.id, size)
    }

    /// Read everything from the current offset to the end
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let remaining = self.size()?.saturating_sub(self.offset) as usize;
        let start = out.len();
        out.resize(start + remaining, 0);

        let mut done = 0;
        while done < remaining {
            let n = self.read(&mut out[start + done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        out.truncate(start + done);
        Ok(done)
    }

    /// Close the handle
    pub fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl<D: NvmDevice> Drop for File<D> {
    fn drop(&mut self) {
        let mut state = self.fs.lock();
        if self.flags.writable() {
            if let Some(entry) = state.index.get_mut(self.id) {
                entry.writer = false;
            }
        }
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}
