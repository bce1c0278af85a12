//! Mount and format
//!
//! Format erases the whole device and writes an empty index image. Mount
//! picks the newest valid metadata slot, then rebuilds the allocator and
//! every page chain from a single linear pass over the data page headers.
//! Interrupted writes are resolved during that pass: pending pages whose
//! version matches their object's commit version are rolled forward, every
//! other pending page is rolled back.

use crate::allocator::{PageAllocator, PageNo, PageOwner, SlotState};
use crate::catalog::ObjectIndex;
use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::header::{read_slot, write_slot, MetaHeader, MetaImage, SlotContents, METADATA_BLOCKS};
use crate::nvm::NvmDevice;
use crate::page::{is_erased, payload_size, Page, PageState, INVALID_OBJECT_ID};
use ahash::AHashMap;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// State rebuilt by a successful mount
pub(crate) struct Mounted {
    pub allocator: PageAllocator,
    pub index: ObjectIndex,
    pub active_slot: u32,
    pub generation: u32,
    pub next_version: u32,
    /// Rolled-forward pages whose promotion failed
    pub pending_promotions: Vec<(PageNo, PageOwner)>,
}

/// Best surviving copy of one `(object, sequence)` pair
#[derive(Debug, Clone, Copy)]
struct Candidate {
    page: PageNo,
    version: u32,
    pending: bool,
}

fn check_geometry<D: NvmDevice + ?Sized>(device: &D, config: &FsConfig) -> Result<()> {
    config.check()?;
    let geometry = device.geometry();
    geometry.validate()?;
    if config.geometry() != geometry {
        return Err(FsError::Config(format!(
            "configured geometry {:?} does not match device geometry {:?}",
            config.geometry(),
            geometry
        )));
    }
    Ok(())
}

/// Erase the device and write an empty file system
pub fn format<D: NvmDevice + ?Sized>(device: &mut D, config: &FsConfig) -> Result<()> {
    check_geometry(device, config)?;
    let geometry = device.geometry();

    device.init()?;
    device.format()?;

    for block in 0..geometry.block_count {
        device.erase(block)?;
    }

    let mut header = MetaHeader::new(geometry);
    header.generation = 1;
    let mut image = MetaImage {
        header,
        records: Vec::new(),
    };
    write_slot(device, 0, &mut image)?;

    info!(
        "Formatted device: {} blocks of {} x {} bytes",
        geometry.block_count, geometry.pages_per_block, geometry.page_size
    );
    Ok(())
}

/// Pick the metadata image to mount from
fn select_image<D: NvmDevice + ?Sized>(device: &mut D) -> Result<(u32, MetaImage)> {
    let mut best: Option<(u32, MetaImage)> = None;
    let mut problems = Vec::new();

    for slot in 0..METADATA_BLOCKS {
        match read_slot(device, slot)? {
            SlotContents::Blank => {}
            SlotContents::Invalid(reason) => {
                warn!("Metadata slot {} is invalid: {}", slot, reason);
                problems.push(format!("slot {}: {}", slot, reason));
            }
            SlotContents::Valid(image) => {
                let newer = best
                    .as_ref()
                    .map_or(true, |(_, b)| image.header.generation > b.header.generation);
                if newer {
                    best = Some((slot, image));
                }
            }
        }
    }

    match best {
        Some(found) => Ok(found),
        None if problems.is_empty() => Err(FsError::NotFormatted),
        None => Err(FsError::Corrupt(problems.join("; "))),
    }
}

/// Rebuild the in-memory state from the device
pub(crate) fn scan<D: NvmDevice + ?Sized>(device: &mut D, config: &FsConfig) -> Result<Mounted> {
    check_geometry(device, config)?;
    let geometry = device.geometry();

    device.init()?;
    device.mount()?;

    let (active_slot, image) = select_image(device)?;
    let next_object_id = image.header.next_object_id;
    let mut index = ObjectIndex::from_records(&image.records, next_object_id)?;
    let mut allocator = PageAllocator::new(geometry);
    let payload = payload_size(geometry.page_size) as u64;

    let mut candidates: AHashMap<u32, BTreeMap<u32, Candidate>> = AHashMap::new();
    let mut max_version = 0u32;
    let mut rolled_back = 0usize;
    let mut buf = vec![0u8; geometry.page_size as usize];

    for page in allocator.data_pages() {
        device.read_exact(geometry.page_addr(page), &mut buf)?;
        if is_erased(&buf) {
            allocator.install(page, SlotState::Free, None);
            continue;
        }

        let decoded = Page::from_bytes(&buf)?;
        let header = decoded.header;
        let state = header.state.unwrap_or_else(|| PageState::settle(buf[0]));

        let pending = match state {
            // Programmed but the state byte never landed
            PageState::Free => {
                allocator.install(page, SlotState::Stale, None);
                continue;
            }
            PageState::Bad => {
                allocator.install(page, SlotState::Bad, None);
                continue;
            }
            PageState::Stale => {
                allocator.install(page, SlotState::Stale, None);
                continue;
            }
            PageState::Pending => true,
            PageState::Used => false,
        };

        max_version = max_version.max(header.version);

        if !decoded.verify_checksum() {
            if pending {
                allocator.install(page, SlotState::Stale, None);
                rolled_back += 1;
                continue;
            }
            return Err(FsError::Corrupt(format!(
                "used page {} fails its checksum",
                page
            )));
        }

        let entry = match index.get(header.object_id) {
            Some(entry) => entry,
            None if header.object_id != INVALID_OBJECT_ID && header.object_id < next_object_id => {
                // Object retired by a committed truncate or remove
                allocator.install(page, SlotState::Stale, None);
                continue;
            }
            None => {
                return Err(FsError::Corrupt(format!(
                    "page {} belongs to unknown object {}",
                    page, header.object_id
                )));
            }
        };

        let live = (!pending || header.version == entry.commit_version)
            && (header.sequence as u64) * payload < entry.size;
        if !live {
            allocator.install(page, SlotState::Stale, None);
            if pending {
                rolled_back += 1;
            }
            continue;
        }

        let owner = PageOwner {
            object_id: header.object_id,
            sequence: header.sequence,
            version: header.version,
        };
        allocator.install(
            page,
            if pending { SlotState::Pending } else { SlotState::Used },
            Some(owner),
        );

        let found = Candidate {
            page,
            version: header.version,
            pending,
        };
        let slots = candidates.entry(header.object_id).or_default();
        match slots.get(&header.sequence).copied() {
            Some(existing) if existing.version >= found.version => {
                allocator.install(page, SlotState::Stale, None);
            }
            Some(existing) => {
                allocator.install(existing.page, SlotState::Stale, None);
                slots.insert(header.sequence, found);
            }
            None => {
                slots.insert(header.sequence, found);
            }
        }
    }

    // Relink every chain in sequence order
    let mut ids: Vec<u32> = index.iter().map(|e| e.id).collect();
    ids.sort_unstable();
    let mut roll_forward = Vec::new();

    for id in ids {
        let (size, name) = match index.get(id) {
            Some(entry) => (entry.size, entry.name.clone()),
            None => continue,
        };
        let count = u32::try_from(size.div_ceil(payload)).map_err(|_| {
            FsError::Corrupt(format!("object {:?} has impossible size {}", name, size))
        })?;
        let slots = candidates.remove(&id).unwrap_or_default();

        index.set_size(id, 0)?;
        for sequence in 0..count {
            let found = slots.get(&sequence).ok_or_else(|| {
                FsError::Corrupt(format!("object {:?} is missing page {}", name, sequence))
            })?;
            let bytes = (size - sequence as u64 * payload).min(payload);
            index.append_page(&mut allocator, id, found.page, bytes)?;
            if found.pending {
                roll_forward.push((
                    found.page,
                    PageOwner {
                        object_id: id,
                        sequence,
                        version: found.version,
                    },
                ));
            }
        }
    }

    // Committed pages still marked pending on flash
    let mut pending_promotions = Vec::new();
    for (page, owner) in roll_forward {
        match device.write(geometry.page_addr(page), &[PageState::Used as u8]) {
            Ok(_) => allocator.mark_used(page),
            Err(err) => {
                warn!("Could not promote rolled-forward page {}: {}", page, err);
                pending_promotions.push((page, owner));
            }
        }
    }

    let next_version = image
        .header
        .next_version
        .max(max_version.saturating_add(1));

    if rolled_back > 0 {
        warn!("Rolled back {} pages of interrupted writes", rolled_back);
    }
    debug!(
        "Mount scan: {} objects, {} free, {} stale, {} bad pages",
        index.len(),
        allocator.free_pages(),
        allocator.count(SlotState::Stale),
        allocator.count(SlotState::Bad)
    );

    Ok(Mounted {
        allocator,
        index,
        active_slot,
        generation: image.header.generation,
        next_version,
        pending_promotions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::{Geometry, RamDevice};

    fn geometry() -> Geometry {
        Geometry::new(64, 4, 8)
    }

    #[test]
    fn test_blank_device_is_not_formatted() {
        let mut dev = RamDevice::new(geometry());
        let config = FsConfig::for_geometry(geometry());
        assert!(matches!(
            scan(&mut dev, &config),
            Err(FsError::NotFormatted)
        ));
    }

    #[test]
    fn test_format_then_scan() {
        let mut dev = RamDevice::new(geometry());
        let config = FsConfig::for_geometry(geometry());
        format(&mut dev, &config).unwrap();

        let mounted = scan(&mut dev, &config).unwrap();
        assert_eq!(mounted.active_slot, 0);
        assert_eq!(mounted.generation, 1);
        assert!(mounted.index.is_empty());
        assert_eq!(mounted.allocator.free_pages(), 24);
        assert_eq!(mounted.next_version, 1);
    }

    #[test]
    fn test_geometry_mismatch_is_config_error() {
        let mut dev = RamDevice::new(geometry());
        let config = FsConfig::for_geometry(Geometry::new(64, 4, 16));
        assert!(matches!(format(&mut dev, &config), Err(FsError::Config(_))));
    }

    #[test]
    fn test_orphan_page_of_unknown_object_is_corrupt() {
        let mut dev = RamDevice::new(geometry());
        let config = FsConfig::for_geometry(geometry());
        format(&mut dev, &config).unwrap();

        // A used page owned by an id that was never handed out
        let mut page = Page::new(64, 5, 0, 1, b"x".to_vec()).unwrap().to_bytes();
        page[0] = PageState::Used as u8;
        let addr = geometry().page_addr(8) as usize;
        dev.as_bytes_mut()[addr..addr + 64].copy_from_slice(&page);

        assert!(matches!(scan(&mut dev, &config), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn test_impossible_object_size_is_corrupt() {
        let mut dev = RamDevice::new(geometry());
        let config = FsConfig::for_geometry(geometry());
        format(&mut dev, &config).unwrap();

        // Checksums are fine, the recorded size is not
        let mut header = MetaHeader::new(geometry());
        header.generation = 2;
        header.next_object_id = 2;
        let mut image = MetaImage {
            header,
            records: vec![crate::header::IndexRecord {
                object_id: 1,
                name: "huge".into(),
                size: u64::MAX,
                commit_version: 1,
            }],
        };
        write_slot(&mut dev, 1, &mut image).unwrap();

        assert!(matches!(scan(&mut dev, &config), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn test_torn_page_program_is_stale() {
        let mut dev = RamDevice::new(geometry());
        let config = FsConfig::for_geometry(geometry());
        format(&mut dev, &config).unwrap();

        // Payload bytes landed, state byte still erased
        let addr = geometry().page_addr(9) as usize;
        dev.as_bytes_mut()[addr + 30] = 0x12;

        let mounted = scan(&mut dev, &config).unwrap();
        assert_eq!(mounted.allocator.state(9), SlotState::Stale);
        assert_eq!(mounted.allocator.free_pages(), 23);
    }
}
