//! Object index
//!
//! Maps object names to ids and ids to their metadata and page chains.
//! The index lives in memory and is persisted as a list of
//! [`IndexRecord`]s in the metadata region. Page chains are not persisted:
//! the mount scan relinks them from the page headers.

pub mod metadata;

pub use metadata::{validate_name, ObjectEntry, MAX_NAME_LEN};

use crate::allocator::{PageAllocator, PageNo};
use crate::error::{FsError, Result};
use crate::header::IndexRecord;
use crate::page::{ERASED_OBJECT_ID, INVALID_OBJECT_ID};
use ahash::AHashMap;

/// Outcome of [`ObjectIndex::create`]
#[derive(Debug)]
pub struct Created {
    pub id: u32,
    /// Entry displaced by an overwrite. Its chain still has to be released
    /// once the new index is committed.
    pub replaced: Option<ObjectEntry>,
}

#[derive(Debug, Clone)]
pub struct ObjectIndex {
    /// Name -> object id
    names: AHashMap<String, u32>,

    /// Object id -> metadata
    entries: AHashMap<u32, ObjectEntry>,

    /// Next id to hand out
    next_object_id: u32,
}

impl Default for ObjectIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectIndex {
    /// Create an empty index
    pub fn new() -> Self {
        ObjectIndex {
            names: AHashMap::new(),
            entries: AHashMap::new(),
            next_object_id: INVALID_OBJECT_ID + 1,
        }
    }

    /// Rebuild the index from a persisted image
    pub fn from_records(records: &[IndexRecord], next_object_id: u32) -> Result<Self> {
        let mut index = ObjectIndex {
            names: AHashMap::with_capacity(records.len()),
            entries: AHashMap::with_capacity(records.len()),
            next_object_id,
        };

        for record in records {
            if record.object_id == INVALID_OBJECT_ID
                || record.object_id == ERASED_OBJECT_ID
                || record.object_id >= next_object_id
            {
                return Err(FsError::Corrupt(format!(
                    "index record {:?} has invalid object id {}",
                    record.name, record.object_id
                )));
            }
            if index.names.insert(record.name.clone(), record.object_id).is_some() {
                return Err(FsError::Corrupt(format!(
                    "duplicate object name {:?} in index",
                    record.name
                )));
            }
            if index
                .entries
                .insert(record.object_id, ObjectEntry::from_record(record))
                .is_some()
            {
                return Err(FsError::Corrupt(format!(
                    "duplicate object id {} in index",
                    record.object_id
                )));
            }
        }

        Ok(index)
    }

    /// Persisted form of the index, ordered by object id
    pub fn to_records(&self) -> Vec<IndexRecord> {
        let mut records: Vec<_> = self.entries.values().map(|e| e.to_record()).collect();
        records.sort_by_key(|r| r.object_id);
        records
    }

    pub fn next_object_id(&self) -> u32 {
        self.next_object_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an object id by name
    pub fn resolve(&self, name: &str) -> Result<u32> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn get(&self, id: u32) -> Option<&ObjectEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut ObjectEntry> {
        self.entries.get_mut(&id)
    }

    /// Metadata of a live object, `StaleHandle` if the id was retired
    pub fn live(&self, id: u32) -> Result<&ObjectEntry> {
        self.entries.get(&id).ok_or(FsError::StaleHandle)
    }

    pub fn live_mut(&mut self, id: u32) -> Result<&mut ObjectEntry> {
        self.entries.get_mut(&id).ok_or(FsError::StaleHandle)
    }

    /// Install a new empty object under `name`
    ///
    /// An existing object of the same name is an error unless `overwrite`
    /// is set, in which case it is replaced by a fresh object with a new id.
    /// Handles on the old id go stale.
    pub fn create(&mut self, name: &str, overwrite: bool) -> Result<Created> {
        let replaced = match self.names.get(name).copied() {
            Some(_) if !overwrite => return Err(FsError::AlreadyExists(name.to_string())),
            Some(old_id) => self.entries.remove(&old_id),
            None => None,
        };

        let id = self.next_object_id;
        if id == ERASED_OBJECT_ID {
            return Err(FsError::NoSpace);
        }
        self.next_object_id += 1;

        self.names.insert(name.to_string(), id);
        self.entries.insert(id, ObjectEntry::new(id, name));

        Ok(Created { id, replaced })
    }

    /// Drop an object from the index and return its metadata
    pub fn remove(&mut self, name: &str) -> Result<ObjectEntry> {
        let id = self.resolve(name)?;
        self.names.remove(name);
        self.entries
            .remove(&id)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    /// Link `page` after the current tail of the object's chain and grow the
    /// size by `bytes`
    pub fn append_page(
        &mut self,
        allocator: &mut PageAllocator,
        id: u32,
        page: PageNo,
        bytes: u64,
    ) -> Result<()> {
        let entry = self.live_mut(id)?;

        match allocator.chain(entry.head).last() {
            Some(&tail) => allocator.set_next(tail, Some(page)),
            None => entry.head = Some(page),
        }
        allocator.set_next(page, None);
        entry.size += bytes;

        Ok(())
    }

    pub fn set_size(&mut self, id: u32, size: u64) -> Result<()> {
        self.live_mut(id)?.size = size;
        Ok(())
    }

    /// All objects, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.entries.values()
    }

    /// Mark every page of a chain stale in memory
    ///
    /// The state bytes on flash are left alone: after the index commit the
    /// owner id is retired and the mount scan treats the pages as stale.
    pub fn release_chain(allocator: &mut PageAllocator, head: Option<PageNo>) -> usize {
        let pages = allocator.chain(head);
        for &page in &pages {
            allocator.release(page);
        }
        pages.len()
    }
}
