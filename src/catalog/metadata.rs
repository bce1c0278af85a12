//! Object metadata structures

use crate::allocator::PageNo;
use crate::error::{FsError, Result};
use crate::header::IndexRecord;

/// Hard upper bound for object names, whatever the configuration says
pub const MAX_NAME_LEN: usize = 255;

/// Object metadata stored in the index
///
/// Everything about an object except its content:
/// - Name and size
/// - Head of the page chain (where the content lives)
/// - Version of the last committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Object id, never reused within a formatted device
    pub id: u32,

    /// Full name (flat namespace, `/` has no meaning)
    pub name: String,

    /// Logical size in bytes
    pub size: u64,

    /// First page of the chain, `None` for an object without pages
    pub head: Option<PageNo>,

    /// Write transaction whose pages are the committed content
    pub commit_version: u32,

    /// A handle with write access is open (in memory only)
    pub writer: bool,
}

impl ObjectEntry {
    /// Create an empty object
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        ObjectEntry {
            id,
            name: name.into(),
            size: 0,
            head: None,
            commit_version: 0,
            writer: false,
        }
    }

    /// Rebuild an entry from its persisted record. The chain is linked
    /// later by the mount scan.
    pub fn from_record(record: &IndexRecord) -> Self {
        ObjectEntry {
            id: record.object_id,
            name: record.name.clone(),
            size: record.size,
            head: None,
            commit_version: record.commit_version,
            writer: false,
        }
    }

    pub fn to_record(&self) -> IndexRecord {
        IndexRecord {
            object_id: self.id,
            name: self.name.clone(),
            size: self.size,
            commit_version: self.commit_version,
        }
    }

    /// Number of pages needed to hold `size` bytes
    pub fn page_count(&self, payload_size: usize) -> usize {
        (self.size as usize + payload_size - 1) / payload_size
    }
}

/// Check an object name against the naming rules
pub fn validate_name(name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("object name is empty".into()));
    }

    let limit = max_len.min(MAX_NAME_LEN);
    if name.len() > limit {
        return Err(FsError::InvalidArgument(format!(
            "object name is {} bytes long (max: {})",
            name.len(),
            limit
        )));
    }

    if name.contains('\0') {
        return Err(FsError::InvalidArgument(
            "object name contains a NUL byte".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = ObjectEntry::new(3, "fs/story.txt");
        assert_eq!(entry.id, 3);
        assert_eq!(entry.size, 0);
        assert_eq!(entry.head, None);
        assert!(!entry.writer);
    }

    #[test]
    fn test_record_conversion() {
        let mut entry = ObjectEntry::new(9, "counter");
        entry.size = 2;
        entry.commit_version = 14;
        entry.head = Some(40);
        entry.writer = true;

        let back = ObjectEntry::from_record(&entry.to_record());
        assert_eq!(back.id, 9);
        assert_eq!(back.size, 2);
        assert_eq!(back.commit_version, 14);
        // Chain and writer flag are not persisted
        assert_eq!(back.head, None);
        assert!(!back.writer);
    }

    #[test]
    fn test_page_count() {
        let mut entry = ObjectEntry::new(1, "a");
        assert_eq!(entry.page_count(44), 0);
        entry.size = 44;
        assert_eq!(entry.page_count(44), 1);
        entry.size = 45;
        assert_eq!(entry.page_count(44), 2);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("fs/story.txt", 32).is_ok());
        assert!(validate_name("", 32).is_err());
        assert!(validate_name("a\0b", 32).is_err());
        assert!(validate_name(&"x".repeat(33), 32).is_err());
        assert!(validate_name(&"x".repeat(256), 1000).is_err());
    }
}
