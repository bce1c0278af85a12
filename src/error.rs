//! Error types for file system and device operations

use thiserror::Error;

/// Errors reported by an [`NvmDevice`](crate::nvm::NvmDevice) implementation.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Address range {addr:#x}+{len} lies outside the device")]
    OutOfBounds { addr: u32, len: usize },

    #[error("Erase block {0} lies outside the device")]
    InvalidBlock(u32),

    #[error("Short read at {addr:#x}: {got} of {expected} bytes")]
    ShortRead { addr: u32, expected: usize, got: usize },

    #[error("Device is unreachable")]
    Unreachable,

    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raw negative status returned by a driver (or a scripted mock).
    #[error("Device returned error code {0}")]
    Code(i32),
}

impl DeviceError {
    /// Negative status code in the C driver convention.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::Code(code) if *code < 0 => *code,
            DeviceError::OutOfBounds { .. } | DeviceError::InvalidBlock(_) => errno::EINVAL,
            DeviceError::Unreachable => errno::ENODEV,
            _ => errno::EIO,
        }
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Device is not formatted")]
    NotFormatted,

    #[error("File system metadata is corrupt: {0}")]
    Corrupt(String),

    #[error("No such object: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Out of space: no free pages available after garbage collection")]
    NoSpace,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Stale handle: the object was truncated or removed")]
    StaleHandle,

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Negative errno equivalent, for callers that speak the C-style
    /// "0 or negative error" contract.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::Device(err) => err.code(),
            FsError::NotFormatted => errno::ENODEV,
            FsError::Corrupt(_) => errno::EBADMSG,
            FsError::NotFound(_) => errno::ENOENT,
            FsError::AlreadyExists(_) => errno::EEXIST,
            FsError::NoSpace => errno::ENOSPC,
            FsError::InvalidArgument(_) | FsError::Config(_) => errno::EINVAL,
            FsError::StaleHandle => errno::ESTALE,
            FsError::Busy(_) => errno::EBUSY,
            FsError::Io(_) => errno::EIO,
        }
    }
}

impl From<toml::de::Error> for FsError {
    fn from(err: toml::de::Error) -> Self {
        FsError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for FsError {
    fn from(err: validator::ValidationErrors) -> Self {
        FsError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Negative errno values used by [`FsError::errno`].
pub mod errno {
    pub const ENOENT: i32 = -2;
    pub const EIO: i32 = -5;
    pub const EBUSY: i32 = -16;
    pub const EEXIST: i32 = -17;
    pub const ENODEV: i32 = -19;
    pub const EINVAL: i32 = -22;
    pub const ENOSPC: i32 = -28;
    pub const EBADMSG: i32 = -74;
    pub const ESTALE: i32 = -116;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound("x".into()).errno(), -2);
        assert_eq!(FsError::NoSpace.errno(), -28);
        assert_eq!(FsError::StaleHandle.errno(), -116);
        assert_eq!(FsError::NotFormatted.errno(), -19);
    }

    #[test]
    fn test_device_code_passthrough() {
        let err = FsError::from(DeviceError::Code(-42));
        assert_eq!(err.errno(), -42);

        // Positive driver codes are not valid errno values
        assert_eq!(DeviceError::Code(3).code(), errno::EIO);
    }
}
