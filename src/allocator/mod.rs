//! Page allocator
//!
//! Owns the state of every data page (everything after the metadata
//! blocks) and the chain links between pages of an object. Links are plain
//! page numbers stored in an arena indexed by physical page, so chains hold
//! no references and cannot form ownership cycles; `None` terminates a chain.
//!
//! Allocation walks the free bitmap from a rotating cursor. Pages are handed
//! out in address order around the device, so a block that was just erased
//! is the last to be reused. One block worth of free pages is held back for
//! garbage collection.

pub mod bitmap;

pub use bitmap::PageBitmap;

use crate::header::METADATA_BLOCKS;
use crate::nvm::Geometry;
use std::ops::Range;

/// Physical page number (page address / page size)
pub type PageNo = u32;

/// In-memory page state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Allocated to a write that has not committed yet
    Pending,
    Used,
    Stale,
    Bad,
}

/// Owner of an allocated page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOwner {
    pub object_id: u32,
    pub sequence: u32,
    pub version: u32,
}

/// Arena entry for one physical page
#[derive(Debug, Clone)]
pub struct PageSlot {
    pub state: SlotState,
    pub owner: Option<PageOwner>,
    /// Successor in the owning object's chain
    pub next: Option<PageNo>,
}

impl PageSlot {
    fn free() -> Self {
        PageSlot {
            state: SlotState::Free,
            owner: None,
            next: None,
        }
    }
}

/// Page counts of one erase block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockUsage {
    pub free: u32,
    pub pending: u32,
    pub used: u32,
    pub stale: u32,
    pub bad: u32,
}

pub struct PageAllocator {
    geometry: Geometry,

    /// First data page (after the metadata blocks)
    first_page: PageNo,

    /// One slot per data page
    slots: Vec<PageSlot>,

    /// Free/taken bitmap over the data pages
    free_map: PageBitmap,

    /// Erase counter per data block
    erase_counts: Vec<u32>,

    /// Where the next free-page search starts
    cursor: usize,

    /// Free pages held back for garbage collection
    reserve: usize,
}

impl PageAllocator {
    /// Create an allocator with every data page free
    pub fn new(geometry: Geometry) -> Self {
        let first_page = METADATA_BLOCKS * geometry.pages_per_block;
        let data_pages = (geometry.total_pages() - first_page) as usize;
        let data_blocks = (geometry.block_count - METADATA_BLOCKS) as usize;

        PageAllocator {
            geometry,
            first_page,
            slots: vec![PageSlot::free(); data_pages],
            free_map: PageBitmap::new(data_pages),
            erase_counts: vec![0; data_blocks],
            cursor: 0,
            reserve: geometry.pages_per_block as usize,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Physical page numbers of the data area
    pub fn data_pages(&self) -> Range<PageNo> {
        self.first_page..self.geometry.total_pages()
    }

    /// Block numbers of the data area
    pub fn data_blocks(&self) -> Range<u32> {
        METADATA_BLOCKS..self.geometry.block_count
    }

    pub fn pages_of_block(&self, block: u32) -> Range<PageNo> {
        let first = block * self.geometry.pages_per_block;
        first..first + self.geometry.pages_per_block
    }

    fn index(&self, page: PageNo) -> usize {
        debug_assert!(self.data_pages().contains(&page), "page {} outside data area", page);
        (page - self.first_page) as usize
    }

    pub fn slot(&self, page: PageNo) -> &PageSlot {
        &self.slots[self.index(page)]
    }

    pub fn state(&self, page: PageNo) -> SlotState {
        self.slot(page).state
    }

    pub fn owner(&self, page: PageNo) -> Option<PageOwner> {
        self.slot(page).owner
    }

    pub fn free_pages(&self) -> usize {
        self.free_map.free_count()
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    /// Free pages available to writers (the GC reserve excluded)
    pub fn available(&self) -> usize {
        self.free_pages().saturating_sub(self.reserve)
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    pub fn erase_counts(&self) -> &[u32] {
        &self.erase_counts
    }

    pub fn erase_count(&self, block: u32) -> u32 {
        self.erase_counts[(block - METADATA_BLOCKS) as usize]
    }

    /// Allocate a free page for `owner`, leaving it pending
    ///
    /// Writers (`use_reserve == false`) cannot dip into the GC reserve.
    /// Pages of `exclude_block` are never returned.
    pub fn allocate(
        &mut self,
        owner: PageOwner,
        use_reserve: bool,
        exclude_block: Option<u32>,
    ) -> Option<PageNo> {
        if !use_reserve && self.free_pages() <= self.reserve {
            return None;
        }

        let exclude = exclude_block.map(|block| {
            let pages = self.pages_of_block(block);
            self.index(pages.start)..self.index(pages.start) + pages.len()
        });

        let index = self.free_map.find_free_from(self.cursor, exclude)?;
        self.free_map.take(index);
        self.cursor = (index + 1) % self.slots.len();

        let slot = &mut self.slots[index];
        slot.state = SlotState::Pending;
        slot.owner = Some(owner);
        slot.next = None;

        Some(self.first_page + index as PageNo)
    }

    /// Pending -> used, once the page's write has committed
    pub fn mark_used(&mut self, page: PageNo) {
        let index = self.index(page);
        debug_assert_ne!(self.slots[index].state, SlotState::Free);
        self.slots[index].state = SlotState::Used;
    }

    /// Used/pending -> stale. The page becomes reclaimable by GC.
    pub fn release(&mut self, page: PageNo) {
        let index = self.index(page);
        let slot = &mut self.slots[index];
        if slot.state == SlotState::Bad {
            return;
        }
        if slot.state == SlotState::Free {
            tracing::warn!("Release of free page {}", page);
            return;
        }
        slot.state = SlotState::Stale;
        slot.next = None;
    }

    /// Retire a page for the rest of the session
    pub fn mark_bad(&mut self, page: PageNo) {
        let index = self.index(page);
        self.free_map.take(index);
        let slot = &mut self.slots[index];
        slot.state = SlotState::Bad;
        slot.next = None;
    }

    /// Retire every page of a block whose erase failed
    pub fn mark_block_bad(&mut self, block: u32) {
        for page in self.pages_of_block(block) {
            self.mark_bad(page);
        }
    }

    /// Record a successful erase: every page of the block that is not bad
    /// becomes free.
    pub fn block_erased(&mut self, block: u32) {
        for page in self.pages_of_block(block) {
            let index = self.index(page);
            if self.slots[index].state == SlotState::Bad {
                continue;
            }
            self.slots[index] = PageSlot::free();
            self.free_map.release(index);
        }
        self.erase_counts[(block - METADATA_BLOCKS) as usize] += 1;
    }

    /// Set the state and owner of a page found during the mount scan
    pub fn install(&mut self, page: PageNo, state: SlotState, owner: Option<PageOwner>) {
        let index = self.index(page);
        if state == SlotState::Free {
            self.free_map.release(index);
        } else {
            self.free_map.take(index);
        }
        self.slots[index] = PageSlot {
            state,
            owner,
            next: None,
        };
    }

    pub fn next(&self, page: PageNo) -> Option<PageNo> {
        self.slot(page).next
    }

    pub fn set_next(&mut self, page: PageNo, next: Option<PageNo>) {
        let index = self.index(page);
        self.slots[index].next = next;
    }

    /// Pages of a chain in order, starting from `head`
    pub fn chain(&self, head: Option<PageNo>) -> Vec<PageNo> {
        let mut pages = Vec::new();
        let mut current = head;
        while let Some(page) = current {
            pages.push(page);
            if pages.len() > self.slots.len() {
                // A cycle would be a bug in the link bookkeeping
                debug_assert!(false, "page chain cycle at {}", page);
                break;
            }
            current = self.next(page);
        }
        pages
    }

    /// Link `pages` into a chain in order. Returns the new head.
    pub fn relink(&mut self, pages: &[PageNo]) -> Option<PageNo> {
        for pair in pages.windows(2) {
            self.set_next(pair[0], Some(pair[1]));
        }
        if let Some(&last) = pages.last() {
            self.set_next(last, None);
        }
        pages.first().copied()
    }

    pub fn block_usage(&self, block: u32) -> BlockUsage {
        let mut usage = BlockUsage::default();
        for page in self.pages_of_block(block) {
            match self.state(page) {
                SlotState::Free => usage.free += 1,
                SlotState::Pending => usage.pending += 1,
                SlotState::Used => usage.used += 1,
                SlotState::Stale => usage.stale += 1,
                SlotState::Bad => usage.bad += 1,
            }
        }
        usage
    }

    /// Block to garbage collect next, if any
    ///
    /// Only blocks holding stale pages and no pending pages qualify. The
    /// block with the highest stale-to-used ratio wins; ties go to fewer
    /// used pages, then to the lower erase count.
    pub fn pick_victim(&self) -> Option<u32> {
        let mut best: Option<(u32, BlockUsage)> = None;

        for block in self.data_blocks() {
            let usage = self.block_usage(block);
            if usage.stale == 0 || usage.pending > 0 {
                continue;
            }

            let better = match &best {
                None => true,
                Some((best_block, best_usage)) => {
                    // stale/used > best_stale/best_used without dividing by zero
                    let lhs = usage.stale as u64 * best_usage.used as u64;
                    let rhs = best_usage.stale as u64 * usage.used as u64;
                    lhs > rhs
                        || (lhs == rhs && usage.used < best_usage.used)
                        || (lhs == rhs
                            && usage.used == best_usage.used
                            && self.erase_count(block) < self.erase_count(*best_block))
                }
            };

            if better {
                best = Some((block, usage));
            }
        }

        best.map(|(block, _)| block)
    }
}
