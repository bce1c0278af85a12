//! Mounted file system
//!
//! [`Filesystem`] is the context object for one mounted device. The object
//! index, page allocator, page cache and the device itself live in one
//! [`FsState`] behind a single lock; every operation takes it for its full
//! duration.
//!
//! # Write transactions
//!
//! A write never modifies a page in place:
//!
//! 1. Every touched page is copied into a freshly allocated page, merged
//!    with the new bytes, and programmed in the pending state with the
//!    transaction number as its version.
//! 2. The metadata image is committed with the new size and the object's
//!    commit version set to the transaction number. This is the commit
//!    point.
//! 3. The new pages are promoted to used and the pages they replace are
//!    released.
//!
//! A failure before step 2 leaves the previous content in place; the
//! pending pages are rolled back at the next mount. A power cut during
//! step 3 is rolled forward, because the pending pages carry the committed
//! version.

use crate::allocator::{PageAllocator, PageNo, PageOwner, SlotState};
use crate::buffer_pool::{CacheStats, PageCache};
use crate::catalog::{validate_name, ObjectIndex};
use crate::config::FsConfig;
use crate::error::{DeviceError, FsError, Result};
use crate::gc::GcReport;
use crate::header::{write_slot, MetaHeader, MetaImage};
use crate::mount::{self, Mounted};
use crate::nvm::{Geometry, NvmDevice};
use crate::page::{payload_size, Page, PageState};
use crate::vfs::{File, OpenFlags};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata of one object as reported by [`Filesystem::stat`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub id: u32,
    pub name: String,
    pub size: u64,
    /// Pages in the object's chain
    pub pages: usize,
    pub commit_version: u32,
}

/// File system usage statistics
#[derive(Debug, Clone)]
pub struct FsStats {
    pub geometry: Geometry,
    pub objects: usize,
    /// Sum of all object sizes
    pub bytes_stored: u64,
    pub free_pages: usize,
    pub pending_pages: usize,
    pub used_pages: usize,
    pub stale_pages: usize,
    pub bad_pages: usize,
    /// Free pages held back for garbage collection
    pub reserve_pages: usize,
    pub min_erase_count: u32,
    pub max_erase_count: u32,
    pub total_erases: u64,
    /// Metadata commit generation
    pub generation: u32,
    pub open_handles: usize,
    pub cache: CacheStats,
}

/// Mounted file system state. Only ever touched with the lock held.
pub(crate) struct FsState<D> {
    pub(crate) device: D,
    pub(crate) config: FsConfig,
    pub(crate) geometry: Geometry,
    pub(crate) allocator: PageAllocator,
    pub(crate) index: ObjectIndex,
    pub(crate) cache: PageCache,

    /// Metadata slot holding the current image
    pub(crate) active_slot: u32,
    pub(crate) generation: u32,

    /// Next write transaction number
    pub(crate) next_version: u32,

    /// Committed pages whose promotion to used failed
    pub(crate) pending_promotions: Vec<(PageNo, PageOwner)>,

    /// Live file handles
    pub(crate) open_handles: usize,
}

/// A mounted file system
///
/// Cheap to clone; clones share the same state. Safe to use from several
/// threads at once.
pub struct Filesystem<D: NvmDevice> {
    pub(crate) shared: Arc<Mutex<FsState<D>>>,
}

impl<D: NvmDevice> Clone for Filesystem<D> {
    fn clone(&self) -> Self {
        Filesystem {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: NvmDevice> Filesystem<D> {
    /// Mount a formatted device with the default configuration
    pub fn mount(device: D) -> Result<Self> {
        let config = FsConfig::for_geometry(device.geometry());
        Self::mount_with_config(device, config)
    }

    pub fn mount_with_config(mut device: D, config: FsConfig) -> Result<Self> {
        let mounted = mount::scan(&mut device, &config)?;
        Ok(Self::assemble(device, config, mounted))
    }

    /// Format the device, then mount it
    pub fn format(device: D) -> Result<Self> {
        let config = FsConfig::for_geometry(device.geometry());
        Self::format_with_config(device, config)
    }

    pub fn format_with_config(mut device: D, config: FsConfig) -> Result<Self> {
        mount::format(&mut device, &config)?;
        Self::mount_with_config(device, config)
    }

    /// Mount the device, formatting it first if it holds no valid file
    /// system
    pub fn mount_or_format(device: D) -> Result<Self> {
        let config = FsConfig::for_geometry(device.geometry());
        Self::mount_or_format_with_config(device, config)
    }

    pub fn mount_or_format_with_config(mut device: D, config: FsConfig) -> Result<Self> {
        let mounted = match mount::scan(&mut device, &config) {
            Ok(mounted) => mounted,
            Err(err @ (FsError::NotFormatted | FsError::Corrupt(_))) => {
                warn!("Mount failed ({}), formatting device", err);
                mount::format(&mut device, &config)?;
                mount::scan(&mut device, &config)?
            }
            Err(err) => return Err(err),
        };
        Ok(Self::assemble(device, config, mounted))
    }

    fn assemble(device: D, config: FsConfig, mounted: Mounted) -> Self {
        let cache = PageCache::new(config.cache_pages);
        let state = FsState {
            geometry: device.geometry(),
            device,
            config,
            allocator: mounted.allocator,
            index: mounted.index,
            cache,
            active_slot: mounted.active_slot,
            generation: mounted.generation,
            next_version: mounted.next_version,
            pending_promotions: mounted.pending_promotions,
            open_handles: 0,
        };

        info!(
            "Mounted file system: {} objects, {} free pages, generation {}",
            state.index.len(),
            state.allocator.free_pages(),
            state.generation
        );

        Filesystem {
            shared: Arc::new(Mutex::new(state)),
        }
    }

    /// Unmount and hand back the device
    ///
    /// Fails with `Busy` while file handles or other clones of this
    /// file system are alive.
    pub fn unmount(self) -> Result<D> {
        let mutex = Arc::try_unwrap(self.shared).map_err(|_| {
            FsError::Busy("file system has open handles or other users".into())
        })?;
        let mut state = mutex.into_inner();

        if let Err(err) = state.retry_promotions() {
            // Mount rolls these pages forward
            warn!("Unmounting with unpromoted pages: {}", err);
        }

        info!("Unmounted file system (generation {})", state.generation);
        Ok(state.device)
    }

    /// Hand back the device without touching it, as a power cut would
    ///
    /// Deferred promotions are not retried; the next mount resolves them.
    pub fn into_device(self) -> Result<D> {
        let mutex = Arc::try_unwrap(self.shared).map_err(|_| {
            FsError::Busy("file system has open handles or other users".into())
        })?;
        Ok(mutex.into_inner().device)
    }

    /// Open an object
    ///
    /// Without `CREATE` a missing object is `NotFound`. `TRUNCATE` replaces
    /// the object with a fresh, empty one under the same name; handles on
    /// the old object go stale. Only one handle with `WRITE` may be open
    /// per object.
    pub fn open(&self, name: &str, flags: OpenFlags) -> Result<File<D>> {
        flags.validate()?;

        let mut state = self.shared.lock();
        validate_name(name, state.config.max_name_len())?;

        let existing = state.index.resolve(name).ok();
        let id = match existing {
            Some(_) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) => {
                return Err(FsError::AlreadyExists(name.to_string()));
            }
            Some(id) if flags.contains(OpenFlags::TRUNCATE) => {
                if state.index.live(id)?.writer {
                    return Err(FsError::Busy(format!("{} is open for writing", name)));
                }
                state.create_object(name, true)?
            }
            Some(id) => id,
            None if flags.contains(OpenFlags::CREATE) => state.create_object(name, false)?,
            None => return Err(FsError::NotFound(name.to_string())),
        };

        if flags.writable() {
            let entry = state.index.live_mut(id)?;
            if entry.writer {
                return Err(FsError::Busy(format!("{} is open for writing", name)));
            }
            entry.writer = true;
        }
        state.open_handles += 1;

        debug!("Opened {} (object {}) with {:?}", name, id, flags);
        Ok(File::new(Arc::clone(&self.shared), id, flags))
    }

    /// Remove an object. Handles on it go stale.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.shared.lock();
        let id = state.index.resolve(name)?;
        if state.index.live(id)?.writer {
            return Err(FsError::Busy(format!("{} is open for writing", name)));
        }

        let snapshot = state.index.clone();
        let entry = state.index.remove(name)?;
        if let Err(err) = state.commit() {
            state.index = snapshot;
            return Err(err);
        }

        let released = ObjectIndex::release_chain(&mut state.allocator, entry.head);
        debug!("Removed {} (object {}, {} pages)", name, id, released);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.shared.lock().index.contains(name)
    }

    pub fn stat(&self, name: &str) -> Result<ObjectStat> {
        let state = self.shared.lock();
        let id = state.index.resolve(name)?;
        state.object_stat(id)
    }

    /// All objects, ordered by name
    pub fn list(&self) -> Vec<ObjectStat> {
        let state = self.shared.lock();
        let mut objects: Vec<ObjectStat> = state
            .index
            .iter()
            .filter_map(|entry| state.object_stat(entry.id).ok())
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        objects
    }

    pub fn stats(&self) -> FsStats {
        let state = self.shared.lock();
        let erase_counts = state.allocator.erase_counts();

        FsStats {
            geometry: state.geometry,
            objects: state.index.len(),
            bytes_stored: state.index.iter().map(|e| e.size).sum(),
            free_pages: state.allocator.free_pages(),
            pending_pages: state.allocator.count(SlotState::Pending),
            used_pages: state.allocator.count(SlotState::Used),
            stale_pages: state.allocator.count(SlotState::Stale),
            bad_pages: state.allocator.count(SlotState::Bad),
            reserve_pages: state.allocator.reserve(),
            min_erase_count: erase_counts.iter().copied().min().unwrap_or(0),
            max_erase_count: erase_counts.iter().copied().max().unwrap_or(0),
            total_erases: erase_counts.iter().map(|&c| c as u64).sum(),
            generation: state.generation,
            open_handles: state.open_handles,
            cache: state.cache.stats(),
        }
    }

    /// Collect garbage until no block holds stale pages
    pub fn collect_garbage(&self) -> Result<GcReport> {
        self.shared.lock().collect_all()
    }

    pub fn geometry(&self) -> Geometry {
        self.shared.lock().geometry
    }

    pub fn config(&self) -> FsConfig {
        self.shared.lock().config.clone()
    }
}

impl<D: NvmDevice> FsState<D> {
    pub(crate) fn payload_size(&self) -> usize {
        payload_size(self.geometry.page_size)
    }

    /// Hand out the next write transaction number
    pub(crate) fn next_txn(&mut self) -> Result<u32> {
        let version = self.next_version;
        self.next_version = version
            .checked_add(1)
            .ok_or_else(|| FsError::Corrupt("write version counter exhausted".into()))?;
        Ok(version)
    }

    fn object_stat(&self, id: u32) -> Result<ObjectStat> {
        let entry = self.index.live(id)?;
        Ok(ObjectStat {
            id: entry.id,
            name: entry.name.clone(),
            size: entry.size,
            pages: self.allocator.chain(entry.head).len(),
            commit_version: entry.commit_version,
        })
    }

    /// Install a new empty object and commit the index. An overwritten
    /// object's pages are released once the commit has landed.
    fn create_object(&mut self, name: &str, overwrite: bool) -> Result<u32> {
        let snapshot = self.index.clone();
        let created = self.index.create(name, overwrite)?;

        if let Err(err) = self.commit() {
            self.index = snapshot;
            return Err(err);
        }

        if let Some(old) = created.replaced {
            let released = ObjectIndex::release_chain(&mut self.allocator, old.head);
            debug!(
                "Replaced object {} with {} for {} ({} pages released)",
                old.id, created.id, name, released
            );
        }
        Ok(created.id)
    }

    /// Write the current index into the inactive metadata slot
    pub(crate) fn commit(&mut self) -> Result<()> {
        // An unpromoted page would be orphaned once its object's commit
        // version moves on
        self.retry_promotions()?;

        let slot = 1 - self.active_slot;
        let mut header = MetaHeader::new(self.geometry);
        header.generation = self.generation + 1;
        header.next_object_id = self.index.next_object_id();
        header.next_version = self.next_version;

        let mut image = MetaImage {
            header,
            records: self.index.to_records(),
        };
        write_slot(&mut self.device, slot, &mut image)?;

        self.active_slot = slot;
        self.generation += 1;
        debug!(
            "Committed metadata generation {} to slot {}",
            self.generation, slot
        );
        Ok(())
    }

    /// Promote pages whose promotion failed earlier
    pub(crate) fn retry_promotions(&mut self) -> Result<()> {
        while let Some(&(page, owner)) = self.pending_promotions.first() {
            let current = self.allocator.slot(page);
            if current.state == SlotState::Pending && current.owner == Some(owner) {
                self.program_state(page, PageState::Used)?;
                self.allocator.mark_used(page);
            }
            self.pending_promotions.remove(0);
        }
        Ok(())
    }

    pub(crate) fn program_state(
        &mut self,
        page: PageNo,
        state: PageState,
    ) -> std::result::Result<(), DeviceError> {
        let addr = self.geometry.page_addr(page);
        self.device.write(addr, &[state as u8]).map(|_| ())
    }

    /// Retire a page after a failed program
    pub(crate) fn retire_page(&mut self, page: PageNo) {
        self.allocator.mark_bad(page);
        self.cache.invalidate(page);
        if let Err(err) = self.program_state(page, PageState::Bad) {
            debug!("Could not mark page {} bad on flash: {}", page, err);
        }
        warn!("Page {} retired after a failed program", page);
    }

    /// Verified payload of a data page
    pub(crate) fn read_payload(&mut self, page: PageNo) -> Result<Arc<[u8]>> {
        if let Some(payload) = self.cache.get(page) {
            return Ok(payload);
        }

        let mut bytes = vec![0u8; self.geometry.page_size as usize];
        self.device.read_exact(self.geometry.page_addr(page), &mut bytes)?;
        let decoded = Page::from_bytes(&bytes)?;
        if !decoded.verify_checksum() {
            return Err(FsError::Corrupt(format!("page {} checksum mismatch", page)));
        }

        let payload: Arc<[u8]> = Arc::from(decoded.payload);
        self.cache.put(page, Arc::clone(&payload));
        Ok(payload)
    }

    /// Program a new pending page. A failed program retires the page.
    fn program_page(&mut self, page: PageNo, owner: PageOwner, payload: Vec<u8>) -> Result<()> {
        let built = Page::new(
            self.geometry.page_size,
            owner.object_id,
            owner.sequence,
            owner.version,
            payload,
        )?;
        let addr = self.geometry.page_addr(page);

        match self.device.write(addr, &built.to_bytes()) {
            Ok(_) => {
                self.cache.put(page, Arc::from(built.payload));
                Ok(())
            }
            Err(err) => {
                self.retire_page(page);
                Err(err.into())
            }
        }
    }

    /// Make sure `pages` pages can be handed to a writer, collecting
    /// garbage if the free pool is running low
    fn ensure_available(&mut self, pages: usize) -> Result<()> {
        if pages == 0 {
            return Ok(());
        }
        let low_water = self.config.gc_low_water();
        let mut passes = 0;

        while self.allocator.available() < pages
            || self.allocator.free_pages().saturating_sub(pages) < low_water
        {
            if passes >= self.allocator.data_blocks().len() {
                break;
            }
            match self.allocator.pick_victim() {
                Some(victim) => {
                    self.collect_block(victim)?;
                }
                None => break,
            }
            passes += 1;
        }

        if self.allocator.available() < pages {
            debug!(
                "No space for {} pages ({} free, {} reserved)",
                pages,
                self.allocator.free_pages(),
                self.allocator.reserve()
            );
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Reject a transaction over sequences `first..=last` when it needs
    /// more fresh pages than the device has
    fn check_span(&self, first: u64, last: u64) -> Result<()> {
        let pages = last - first + 1;
        if pages > self.allocator.data_pages().len() as u64 || last >= u32::MAX as u64 {
            debug!(
                "Transaction over pages {}..={} exceeds the device",
                first, last
            );
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at or past EOF.
    pub(crate) fn read_at(&mut self, id: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = self.index.live(id)?;
        if offset >= entry.size || buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min((entry.size - offset) as usize);
        let payload = self.payload_size();
        let chain = self.allocator.chain(entry.head);

        let mut done = 0;
        while done < len {
            let position = offset + done as u64;
            let sequence = (position / payload as u64) as usize;
            let within = (position % payload as u64) as usize;
            let page = *chain.get(sequence).ok_or_else(|| {
                FsError::Corrupt(format!("object {} has no page {}", id, sequence))
            })?;

            let data = self.read_payload(page)?;
            let n = (payload - within).min(len - done);
            buf[done..done + n].copy_from_slice(&data[within..within + n]);
            done += n;
        }

        Ok(done)
    }

    /// Write `data` at `offset` as one transaction. Returns the byte count.
    pub(crate) fn write_at(&mut self, id: u32, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let payload = self.payload_size() as u64;
        let old_size = self.index.live(id)?.size;
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            FsError::InvalidArgument("write past the end of the address space".into())
        })?;

        // A gap past EOF starts at the page holding the old end so its tail
        // is rewritten as zeros
        let first = if offset > old_size {
            old_size / payload
        } else {
            offset / payload
        };
        let last = (end - 1) / payload;
        self.check_span(first, last)?;

        let mut pages = Vec::with_capacity((last - first + 1) as usize);
        for sequence in first..=last {
            let page_start = sequence * payload;
            let lo = offset.max(page_start);
            let hi = end.min(page_start + payload);
            let mut overlay = None;
            if lo < hi {
                let src = &data[(lo - offset) as usize..(hi - offset) as usize];
                overlay = Some(((lo - page_start) as usize, src));
            }
            pages.push((sequence as u32, overlay));
        }

        self.apply(id, &pages, old_size.max(end))?;
        Ok(data.len())
    }

    /// Resize an object. Shrinking releases the pages past the new end,
    /// growing appends zeros.
    pub(crate) fn truncate(&mut self, id: u32, size: u64) -> Result<()> {
        let old_size = self.index.live(id)?.size;
        if size == old_size {
            return Ok(());
        }
        let payload = self.payload_size() as u64;
        if size > old_size {
            // Pages past the old end are staged without an overlay and
            // come out zero-filled
            let first = old_size / payload;
            let last = (size - 1) / payload;
            self.check_span(first, last)?;
            let pages: Vec<(u32, Option<(usize, &[u8])>)> = (first..=last)
                .map(|sequence| (sequence as u32, None))
                .collect();
            return self.apply(id, &pages, size);
        }

        let mut pages = Vec::new();
        if size % payload != 0 {
            // Rewrite the new last page so the cut-off bytes read as zeros
            pages.push(((size / payload) as u32, None));
        }
        self.apply(id, &pages, size)
    }

    /// Copy-on-write transaction over an object
    ///
    /// Each `(sequence, overlay)` gets a fresh page holding the old content
    /// up to the new size (zeros beyond) with the overlay bytes on top. The
    /// chain is cut or extended to `new_size`.
    fn apply(
        &mut self,
        id: u32,
        pages: &[(u32, Option<(usize, &[u8])>)],
        new_size: u64,
    ) -> Result<()> {
        self.ensure_available(pages.len())?;

        // Chain is read after GC, which may have moved pages
        let (old_size, old_chain, old_commit) = {
            let entry = self.index.live(id)?;
            (
                entry.size,
                self.allocator.chain(entry.head),
                entry.commit_version,
            )
        };
        let payload = self.payload_size();
        let txn = self.next_txn()?;

        // 1. Program pending copies
        let mut written: Vec<(u32, PageNo)> = Vec::with_capacity(pages.len());
        for &(sequence, overlay) in pages {
            let valid_size = old_size.min(new_size);
            match self.stage_page(id, txn, sequence, overlay, valid_size, &old_chain, payload) {
                Ok(page) => written.push((sequence, page)),
                Err(err) => {
                    self.abandon(&written);
                    return Err(err);
                }
            }
        }

        // 2. Commit
        {
            let entry = self.index.live_mut(id)?;
            entry.size = new_size;
            entry.commit_version = txn;
        }
        if let Err(err) = self.commit() {
            if let Some(entry) = self.index.get_mut(id) {
                entry.size = old_size;
                entry.commit_version = old_commit;
            }
            self.abandon(&written);
            return Err(err);
        }

        // 3. Relink, promote, release
        let keep = new_size.div_ceil(payload as u64) as usize;
        let mut chain = old_chain.clone();
        let mut replaced = Vec::new();
        for &(sequence, page) in &written {
            let sequence = sequence as usize;
            if sequence < chain.len() {
                replaced.push(chain[sequence]);
                chain[sequence] = page;
            } else {
                debug_assert_eq!(sequence, chain.len());
                chain.push(page);
            }
        }
        let dropped: Vec<PageNo> = if chain.len() > keep {
            chain.split_off(keep)
        } else {
            Vec::new()
        };

        let head = self.allocator.relink(&chain);
        self.index.live_mut(id)?.head = head;

        for &(sequence, page) in &written {
            match self.program_state(page, PageState::Used) {
                Ok(()) => self.allocator.mark_used(page),
                Err(err) => {
                    warn!(
                        "Promotion of page {} failed ({}), deferring until the next commit",
                        page, err
                    );
                    self.pending_promotions.push((
                        page,
                        PageOwner {
                            object_id: id,
                            sequence,
                            version: txn,
                        },
                    ));
                }
            }
        }

        for page in replaced.into_iter().chain(dropped) {
            self.release_page(page);
        }

        debug!(
            "Object {} transaction {}: {} pages written, size {} -> {}",
            id,
            txn,
            written.len(),
            old_size,
            new_size
        );
        Ok(())
    }

    /// Build and program one pending page of a transaction
    #[allow(clippy::too_many_arguments)]
    fn stage_page(
        &mut self,
        id: u32,
        txn: u32,
        sequence: u32,
        overlay: Option<(usize, &[u8])>,
        valid_size: u64,
        old_chain: &[PageNo],
        payload: usize,
    ) -> Result<PageNo> {
        let mut content = vec![0u8; payload];

        let page_start = sequence as u64 * payload as u64;
        if let Some(&old) = old_chain.get(sequence as usize) {
            let valid = valid_size.saturating_sub(page_start).min(payload as u64) as usize;
            if valid > 0 {
                let old_payload = self.read_payload(old)?;
                content[..valid].copy_from_slice(&old_payload[..valid]);
            }
        }
        if let Some((at, bytes)) = overlay {
            content[at..at + bytes.len()].copy_from_slice(bytes);
        }

        let owner = PageOwner {
            object_id: id,
            sequence,
            version: txn,
        };
        let page = self
            .allocator
            .allocate(owner, false, None)
            .ok_or(FsError::NoSpace)?;
        self.program_page(page, owner, content)?;
        Ok(page)
    }

    /// Drop the pending pages of a failed transaction
    fn abandon(&mut self, written: &[(u32, PageNo)]) {
        for &(_, page) in written {
            self.allocator.release(page);
        }
        if !written.is_empty() {
            debug!("Rolled back {} pending pages", written.len());
        }
    }

    /// Mark a superseded page stale. The on-flash state is best effort:
    /// mount resolves duplicates by version.
    pub(crate) fn release_page(&mut self, page: PageNo) {
        self.allocator.release(page);
        if let Err(err) = self.program_state(page, PageState::Stale) {
            debug!("Could not mark page {} stale on flash: {}", page, err);
        }
    }
}
