//! Garbage collection
//!
//! Reclaims stale pages one erase block at a time. Every used page in the
//! victim is copied to a fresh page outside it (new version, programmed
//! pending, then promoted), the owning chain is repointed at the copy, and
//! the emptied block is erased. A power cut at any point leaves either the
//! old copy alone or both copies on flash; mount keeps the higher version.

use crate::allocator::{PageNo, PageOwner, SlotState};
use crate::error::{FsError, Result};
use crate::filesystem::FsState;
use crate::nvm::NvmDevice;
use crate::page::{Page, PageState};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of garbage collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Blocks collected, in order
    pub victims: Vec<u32>,
    /// Live pages copied out of victims
    pub relocated: usize,
    /// Pages returned to the free pool
    pub reclaimed: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }

    fn merge(&mut self, other: GcReport) {
        self.victims.extend(other.victims);
        self.relocated += other.relocated;
        self.reclaimed += other.reclaimed;
    }
}

impl<D: NvmDevice> FsState<D> {
    /// Collect every block holding stale pages
    pub(crate) fn collect_all(&mut self) -> Result<GcReport> {
        let mut report = GcReport::default();
        let limit = self.allocator.data_blocks().len();

        while report.victims.len() < limit {
            match self.allocator.pick_victim() {
                Some(victim) => report.merge(self.collect_block(victim)?),
                None => break,
            }
        }

        if !report.is_empty() {
            debug!(
                "Garbage collection: {} blocks, {} pages relocated, {} reclaimed",
                report.victims.len(),
                report.relocated,
                report.reclaimed
            );
        }
        Ok(report)
    }

    /// Relocate the live pages of `victim` and erase it
    pub(crate) fn collect_block(&mut self, victim: u32) -> Result<GcReport> {
        let mut report = GcReport {
            victims: vec![victim],
            ..Default::default()
        };

        for page in self.allocator.pages_of_block(victim) {
            if self.allocator.state(page) == SlotState::Used {
                self.relocate(page, victim)?;
                report.relocated += 1;
            }
        }

        let pages = self.allocator.pages_of_block(victim);
        match self.device.erase(victim) {
            Ok(()) => {
                let before = self.allocator.free_pages();
                self.allocator.block_erased(victim);
                self.cache.invalidate_range(pages);
                report.reclaimed = self.allocator.free_pages() - before;
            }
            Err(err) => {
                warn!("Erase of block {} failed ({}), retiring it", victim, err);
                self.allocator.mark_block_bad(victim);
                self.cache.invalidate_range(pages);
            }
        }

        Ok(report)
    }

    /// Copy one used page out of `victim` and repoint its chain
    fn relocate(&mut self, page: PageNo, victim: u32) -> Result<()> {
        let owner = self
            .allocator
            .owner(page)
            .ok_or_else(|| FsError::Corrupt(format!("used page {} has no owner", page)))?;
        let head = self
            .index
            .get(owner.object_id)
            .ok_or_else(|| {
                FsError::Corrupt(format!(
                    "page {} belongs to unknown object {}",
                    page, owner.object_id
                ))
            })?
            .head;

        let payload = self.read_payload(page)?;
        let copy_owner = PageOwner {
            version: self.next_txn()?,
            ..owner
        };
        let copy = self
            .allocator
            .allocate(copy_owner, true, Some(victim))
            .ok_or(FsError::NoSpace)?;

        let built = Page::new(
            self.geometry.page_size,
            copy_owner.object_id,
            copy_owner.sequence,
            copy_owner.version,
            payload.to_vec(),
        )?;
        if let Err(err) = self.device.write(self.geometry.page_addr(copy), &built.to_bytes()) {
            self.retire_page(copy);
            return Err(err.into());
        }
        if let Err(err) = self.program_state(copy, PageState::Used) {
            // Still pending on flash, so mount discards it
            self.allocator.release(copy);
            return Err(err.into());
        }
        self.allocator.mark_used(copy);
        self.cache.put(copy, Arc::clone(&payload));

        // Repoint the predecessor (or the head) at the copy
        let next = self.allocator.next(page);
        self.allocator.set_next(copy, next);
        let chain = self.allocator.chain(head);
        match chain.iter().position(|&p| p == page) {
            Some(0) => {
                if let Some(entry) = self.index.get_mut(owner.object_id) {
                    entry.head = Some(copy);
                }
            }
            Some(at) => self.allocator.set_next(chain[at - 1], Some(copy)),
            None => {
                return Err(FsError::Corrupt(format!(
                    "page {} is not in the chain of object {}",
                    page, owner.object_id
                )))
            }
        }
        self.release_page(page);

        debug!(
            "Relocated object {} page {} from {} to {}",
            owner.object_id, owner.sequence, page, copy
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::nvm::{Geometry, RamDevice};
    use crate::vfs::{OpenFlags, Whence};
    use crate::Filesystem;

    #[test]
    fn test_collect_nothing_on_fresh_fs() {
        let fs = Filesystem::format(RamDevice::new(Geometry::new(64, 4, 8))).unwrap();
        let report = fs.collect_garbage().unwrap();
        assert!(report.is_empty());
        assert_eq!(report.relocated, 0);
    }

    #[test]
    fn test_collect_relocates_live_pages() {
        let fs = Filesystem::format(RamDevice::new(Geometry::new(64, 4, 8))).unwrap();
        let mut file = fs
            .open("a", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();

        // Four pages in the first data block, then overwrite two of them
        file.write(&[1u8; 44 * 4]).unwrap();
        file.seek(0, Whence::Set).unwrap();
        file.write(&[2u8; 44 * 2]).unwrap();

        let report = fs.collect_garbage().unwrap();
        assert_eq!(report.victims, vec![2]);
        assert_eq!(report.relocated, 2);
        assert_eq!(report.reclaimed, 4);

        let stats = fs.stats();
        assert_eq!(stats.stale_pages, 0);
        assert_eq!(stats.used_pages, 4);

        let mut out = Vec::new();
        file.seek(0, Whence::Set).unwrap();
        file.read_to_end(&mut out).unwrap();
        assert!(out[..88].iter().all(|&b| b == 2));
        assert!(out[88..].iter().all(|&b| b == 1));
    }
}
