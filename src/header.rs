//! Metadata region: geometry, format marker and the object index image
//!
//! The first two erase blocks of the device form two metadata slots. A
//! commit writes the complete index image into the slot that is not active:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Slot page 0: MetaHeader (format marker)      │  ← written last
//! │  - Magic "NVMFS\0\0\x01", version            │
//! │  - Geometry, generation, id/version counters │
//! │  - Body length + CRC, header CRC             │
//! ├──────────────────────────────────────────────┤
//! │ Slot pages 1..: bincode Vec<IndexRecord>     │  ← written first
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Because the header lands last, an interrupted commit leaves the slot
//! without a valid marker and the previous slot stays authoritative. Mount
//! picks the valid slot with the highest generation.

use crate::error::{FsError, Result};
use crate::nvm::{Geometry, NvmDevice, ERASED};
use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 8] = *b"NVMFS\x00\x00\x01";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Number of erase blocks reserved for metadata slots
pub const METADATA_BLOCKS: u32 = 2;

/// Serialized size of [`MetaHeader`]
pub const META_HEADER_SIZE: usize = 48;

/// Metadata slot header (page 0 of a slot)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaHeader {
    /// Magic number: "NVMFS\0\0\x01"
    pub magic: [u8; 8],

    /// Format version (major)
    pub version_major: u16,

    /// Format version (minor)
    pub version_minor: u16,

    /// Device geometry the file system was formatted with
    pub geometry: Geometry,

    /// Commit counter, the highest valid generation wins at mount
    pub generation: u32,

    /// Next object id to hand out. Ids below it that are missing from the
    /// index belong to retired objects.
    pub next_object_id: u32,

    /// Next write transaction number
    pub next_version: u32,

    /// Length of the serialized index body
    pub body_len: u32,

    /// CRC-32 of the index body
    pub body_crc: u32,
}

/// One object in the persisted index image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub object_id: u32,
    pub name: String,
    pub size: u64,
    pub commit_version: u32,
}

impl MetaHeader {
    /// Create a header for a freshly formatted device
    pub fn new(geometry: Geometry) -> Self {
        MetaHeader {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            geometry,
            generation: 0,
            next_object_id: 1,
            next_version: 1,
            body_len: 0,
            body_crc: 0,
        }
    }

    /// True if the bytes start with the format marker
    pub fn has_marker(bytes: &[u8]) -> bool {
        bytes.len() >= MAGIC.len() && bytes[..MAGIC.len()] == MAGIC
    }

    /// Validate the header against the device it was read from
    pub fn validate(&self, device_geometry: &Geometry) -> Result<()> {
        if self.magic != MAGIC {
            return Err(FsError::NotFormatted);
        }

        if self.version_major != VERSION_MAJOR || self.version_minor != VERSION_MINOR {
            return Err(FsError::Corrupt(format!(
                "unsupported format version {}.{}",
                self.version_major, self.version_minor
            )));
        }

        if self.geometry != *device_geometry {
            return Err(FsError::Corrupt(format!(
                "formatted geometry {:?} does not match device {:?}",
                self.geometry, device_geometry
            )));
        }

        if self.body_len as usize > body_capacity(device_geometry) {
            return Err(FsError::Corrupt(format!(
                "index body of {} bytes exceeds slot capacity",
                self.body_len
            )));
        }

        Ok(())
    }

    /// Serialize header to bytes, trailing CRC included
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(META_HEADER_SIZE);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.extend_from_slice(&self.geometry.page_size.to_le_bytes());
        bytes.extend_from_slice(&self.geometry.pages_per_block.to_le_bytes());
        bytes.extend_from_slice(&self.geometry.block_count.to_le_bytes());
        bytes.extend_from_slice(&self.generation.to_le_bytes());
        bytes.extend_from_slice(&self.next_object_id.to_le_bytes());
        bytes.extend_from_slice(&self.next_version.to_le_bytes());
        bytes.extend_from_slice(&self.body_len.to_le_bytes());
        bytes.extend_from_slice(&self.body_crc.to_le_bytes());

        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes, checking the header CRC
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_HEADER_SIZE {
            return Err(FsError::Corrupt(format!(
                "metadata header needs {} bytes, got {}",
                META_HEADER_SIZE,
                bytes.len()
            )));
        }

        let stored_crc = u32_at(bytes, META_HEADER_SIZE - 4);
        if crc32fast::hash(&bytes[..META_HEADER_SIZE - 4]) != stored_crc {
            return Err(FsError::Corrupt("metadata header checksum mismatch".into()));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);

        Ok(MetaHeader {
            magic,
            version_major: u16::from_le_bytes([bytes[8], bytes[9]]),
            version_minor: u16::from_le_bytes([bytes[10], bytes[11]]),
            geometry: Geometry::new(u32_at(bytes, 12), u32_at(bytes, 16), u32_at(bytes, 20)),
            generation: u32_at(bytes, 24),
            next_object_id: u32_at(bytes, 28),
            next_version: u32_at(bytes, 32),
            body_len: u32_at(bytes, 36),
            body_crc: u32_at(bytes, 40),
        })
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Bytes available for the index body in one slot
pub fn body_capacity(geometry: &Geometry) -> usize {
    (geometry.block_size() - geometry.page_size) as usize
}

/// Complete metadata image: header plus index records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaImage {
    pub header: MetaHeader,
    pub records: Vec<IndexRecord>,
}

/// Result of reading one metadata slot
#[derive(Debug)]
pub enum SlotContents {
    /// No format marker
    Blank,
    /// Marker present but the image does not validate
    Invalid(String),
    Valid(MetaImage),
}

/// Read and validate the image stored in `slot`
pub fn read_slot<D: NvmDevice + ?Sized>(device: &mut D, slot: u32) -> Result<SlotContents> {
    let geometry = device.geometry();
    let base = geometry.block_addr(slot);

    let mut head = vec![0u8; geometry.page_size as usize];
    device.read_exact(base, &mut head)?;
    if !MetaHeader::has_marker(&head) {
        return Ok(SlotContents::Blank);
    }

    let header = match MetaHeader::from_bytes(&head).and_then(|h| {
        h.validate(&geometry)?;
        Ok(h)
    }) {
        Ok(header) => header,
        Err(err) => return Ok(SlotContents::Invalid(err.to_string())),
    };

    let mut body = vec![0u8; header.body_len as usize];
    if !body.is_empty() {
        device.read_exact(base + geometry.page_size, &mut body)?;
    }
    if crc32fast::hash(&body) != header.body_crc {
        return Ok(SlotContents::Invalid("index body checksum mismatch".into()));
    }

    let records: Vec<IndexRecord> = if body.is_empty() {
        Vec::new()
    } else {
        match bincode::deserialize(&body) {
            Ok(records) => records,
            Err(err) => return Ok(SlotContents::Invalid(format!("index body: {}", err))),
        }
    };

    Ok(SlotContents::Valid(MetaImage { header, records }))
}

/// Erase `slot` and write `image` into it, header last
///
/// `image.header.body_len` and `body_crc` are filled in from the records.
pub fn write_slot<D: NvmDevice + ?Sized>(
    device: &mut D,
    slot: u32,
    image: &mut MetaImage,
) -> Result<()> {
    let geometry = device.geometry();
    let base = geometry.block_addr(slot);

    let body = bincode::serialize(&image.records)
        .map_err(|err| FsError::Corrupt(format!("index serialization failed: {}", err)))?;
    if body.len() > body_capacity(&geometry) {
        return Err(FsError::NoSpace);
    }
    image.header.body_len = body.len() as u32;
    image.header.body_crc = crc32fast::hash(&body);

    device.erase(slot)?;
    if !body.is_empty() {
        device.write(base + geometry.page_size, &body)?;
    }

    let mut head = image.header.to_bytes();
    head.resize(geometry.page_size as usize, ERASED);
    device.write(base, &head)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::RamDevice;

    fn geometry() -> Geometry {
        Geometry::new(64, 4, 8)
    }

    #[test]
    fn test_header_serialization() {
        let mut header = MetaHeader::new(geometry());
        header.generation = 7;
        header.next_object_id = 12;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), META_HEADER_SIZE);
        assert!(MetaHeader::has_marker(&bytes));

        let decoded = MetaHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
        decoded.validate(&geometry()).unwrap();
    }

    #[test]
    fn test_header_checksum() {
        let mut bytes = MetaHeader::new(geometry()).to_bytes();
        bytes[24] ^= 1;
        assert!(matches!(
            MetaHeader::from_bytes(&bytes),
            Err(FsError::Corrupt(_))
        ));
    }

    #[test]
    fn test_geometry_mismatch() {
        let header = MetaHeader::new(geometry());
        let other = Geometry::new(64, 4, 16);
        assert!(matches!(header.validate(&other), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn test_slot_round_trip() {
        let mut dev = RamDevice::new(geometry());
        assert!(matches!(read_slot(&mut dev, 0).unwrap(), SlotContents::Blank));

        let mut image = MetaImage {
            header: MetaHeader::new(geometry()),
            records: vec![IndexRecord {
                object_id: 1,
                name: "fs/story.txt".into(),
                size: 16,
                commit_version: 3,
            }],
        };
        write_slot(&mut dev, 1, &mut image).unwrap();

        match read_slot(&mut dev, 1).unwrap() {
            SlotContents::Valid(read) => assert_eq!(read, image),
            other => panic!("unexpected slot contents: {:?}", other),
        }
    }

    #[test]
    fn test_torn_body_is_invalid() {
        let mut dev = RamDevice::new(geometry());
        let mut image = MetaImage {
            header: MetaHeader::new(geometry()),
            records: vec![IndexRecord {
                object_id: 1,
                name: "a".into(),
                size: 1,
                commit_version: 1,
            }],
        };
        write_slot(&mut dev, 0, &mut image).unwrap();

        // Clear the low byte of the first record's object id
        dev.as_bytes_mut()[64 + 8] = 0;
        assert!(matches!(
            read_slot(&mut dev, 0).unwrap(),
            SlotContents::Invalid(_)
        ));
    }

    #[test]
    fn test_image_too_large() {
        let mut dev = RamDevice::new(geometry());
        let records = (0..40)
            .map(|i| IndexRecord {
                object_id: i,
                name: format!("object-{}", i),
                size: 0,
                commit_version: 0,
            })
            .collect();
        let mut image = MetaImage {
            header: MetaHeader::new(geometry()),
            records,
        };
        assert!(matches!(
            write_slot(&mut dev, 0, &mut image),
            Err(FsError::NoSpace)
        ));
    }
}
