//! File handle layer
//!
//! POSIX-style access to objects: open flags, seek origins and the
//! [`File`] handle type.

pub mod file;

pub use file::File;

use crate::error::{FsError, Result};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Flags accepted by [`Filesystem::open`](crate::Filesystem::open)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(0x01);
    pub const WRITE: OpenFlags = OpenFlags(0x02);
    pub const READ_WRITE: OpenFlags = OpenFlags(0x03);
    /// Create the object if it does not exist
    pub const CREATE: OpenFlags = OpenFlags(0x04);
    /// Replace the object with a fresh, empty one
    pub const TRUNCATE: OpenFlags = OpenFlags(0x08);
    /// Every write goes to the current end of the object
    pub const APPEND: OpenFlags = OpenFlags(0x10);
    /// With `CREATE`: fail if the object already exists
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0x20);

    const ALL: u8 = 0x3F;

    pub const fn empty() -> Self {
        OpenFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Flags from raw bits. Unknown bits are an error.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(FsError::InvalidArgument(format!(
                "unknown open flag bits {:#04x}",
                bits & !Self::ALL
            )));
        }
        Ok(OpenFlags(bits))
    }

    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Reject flag combinations that make no sense
    pub fn validate(self) -> Result<()> {
        if !self.readable() && !self.writable() {
            return Err(FsError::InvalidArgument(
                "open flags need READ, WRITE or both".into(),
            ));
        }
        if !self.writable() && (self.contains(Self::TRUNCATE) || self.contains(Self::APPEND)) {
            return Err(FsError::InvalidArgument(
                "TRUNCATE and APPEND require WRITE".into(),
            ));
        }
        if self.contains(Self::EXCLUSIVE) && !self.contains(Self::CREATE) {
            return Err(FsError::InvalidArgument("EXCLUSIVE requires CREATE".into()));
        }
        Ok(())
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: OpenFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OpenFlags, &str); 6] = [
            (OpenFlags::READ, "READ"),
            (OpenFlags::WRITE, "WRITE"),
            (OpenFlags::CREATE, "CREATE"),
            (OpenFlags::TRUNCATE, "TRUNCATE"),
            (OpenFlags::APPEND, "APPEND"),
            (OpenFlags::EXCLUSIVE, "EXCLUSIVE"),
        ];

        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "OpenFlags(empty)")
        } else {
            write!(f, "OpenFlags({})", set.join(" | "))
        }
    }
}

/// Origin of a seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the object
    Set,
    /// From the current offset
    Cur,
    /// From the end of the object
    End,
}
