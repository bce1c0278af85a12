//! On-flash page format
//!
//! Every data page starts with a 20-byte header followed by the payload:
//!
//! ```text
//! ┌───────┬──────────┬───────────┬──────────┬─────────┬─────────┬─────────────┐
//! │ state │ reserved │ object_id │ sequence │ version │  crc32  │ payload ... │
//! │  u8   │  3 x FF  │    u32    │   u32    │   u32   │   u32   │             │
//! └───────┴──────────┴───────────┴──────────┴─────────┴─────────┴─────────────┘
//! ```
//!
//! The state byte is the only field changed after the page is programmed.
//! Each transition clears bits, so it can be applied in place without an
//! erase. The CRC covers object id, sequence, version and payload.

use crate::error::{FsError, Result};
use crate::nvm::ERASED;

/// Size of the page header in bytes
pub const PAGE_HEADER_SIZE: usize = 20;

/// Object ids never assigned to an object.
pub const INVALID_OBJECT_ID: u32 = 0;
pub const ERASED_OBJECT_ID: u32 = u32::MAX;

/// Page state as stored in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Erased, never programmed since
    Free = 0xFF,
    /// Programmed, waiting for its write to commit
    Pending = 0x7F,
    /// Committed, part of an object
    Used = 0x3F,
    /// Superseded, reclaimable by garbage collection
    Stale = 0x0F,
    /// Retired after an I/O failure
    Bad = 0x00,
}

impl PageState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xFF => Some(PageState::Free),
            0x7F => Some(PageState::Pending),
            0x3F => Some(PageState::Used),
            0x0F => Some(PageState::Stale),
            0x00 => Some(PageState::Bad),
            _ => None,
        }
    }

    /// Classify a state byte that matches no known state, i.e. a state
    /// program interrupted part way through.
    pub fn settle(value: u8) -> Self {
        match value {
            0xFF => PageState::Free,
            v if v & 0x80 != 0 => PageState::Stale,
            0x40..=0x7F => PageState::Pending,
            0x10..=0x3F => PageState::Stale,
            _ => PageState::Bad,
        }
    }
}

/// Decoded page header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// State byte. `None` if the byte holds no known state (torn program).
    pub state: Option<PageState>,

    /// Owning object
    pub object_id: u32,

    /// Position of this page in the object's chain
    pub sequence: u32,

    /// Write transaction that produced this page
    pub version: u32,

    /// CRC-32 of the header fields and payload
    pub crc: u32,
}

impl PageHeader {
    pub fn new(object_id: u32, sequence: u32, version: u32) -> Self {
        PageHeader {
            state: Some(PageState::Pending),
            object_id,
            sequence,
            version,
            crc: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut bytes = [ERASED; PAGE_HEADER_SIZE];
        bytes[0] = self.state.map(|s| s as u8).unwrap_or(ERASED);
        bytes[4..8].copy_from_slice(&self.object_id.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.version.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(FsError::Corrupt(format!(
                "page header needs {} bytes, got {}",
                PAGE_HEADER_SIZE,
                bytes.len()
            )));
        }

        Ok(PageHeader {
            state: PageState::from_u8(bytes[0]),
            object_id: read_u32(bytes, 4),
            sequence: read_u32(bytes, 8),
            version: read_u32(bytes, 12),
            crc: read_u32(bytes, 16),
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Payload bytes per page for a given page size.
pub fn payload_size(page_size: u32) -> usize {
    page_size as usize - PAGE_HEADER_SIZE
}

/// A full data page: header plus payload
#[derive(Debug, Clone)]
pub struct Page {
    pub header: PageHeader,
    pub payload: Vec<u8>,
}

impl Page {
    /// Build a pending page. `payload` is padded with zeros to the page's
    /// payload size.
    pub fn new(
        page_size: u32,
        object_id: u32,
        sequence: u32,
        version: u32,
        mut payload: Vec<u8>,
    ) -> Result<Self> {
        let max = payload_size(page_size);
        if payload.len() > max {
            return Err(FsError::InvalidArgument(format!(
                "page payload too large: {} bytes (max: {})",
                payload.len(),
                max
            )));
        }
        payload.resize(max, 0);

        let mut page = Page {
            header: PageHeader::new(object_id, sequence, version),
            payload,
        };
        page.header.crc = page.compute_checksum();
        Ok(page)
    }

    /// CRC-32 over the immutable header fields and the payload
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.header.object_id.to_le_bytes());
        hasher.update(&self.header.sequence.to_le_bytes());
        hasher.update(&self.header.version.to_le_bytes());
        hasher.update(&self.payload);
        hasher.finalize()
    }

    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.header.crc
    }

    /// Serialize to exactly one page of bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = PageHeader::from_bytes(bytes)?;
        Ok(Page {
            header,
            payload: bytes[PAGE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// True if every byte of the slice is erased
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == ERASED)
}
