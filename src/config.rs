//! File system configuration
//!
//! Loaded from TOML or assembled with [`FsBuilder`](crate::FsBuilder):
//!
//! ```toml
//! page_size = 256
//! pages_per_block = 16
//! block_count = 64
//! gc_low_water = 32
//! cache_pages = 64
//! max_name_len = 32
//! ```
//!
//! Every field is optional and falls back to the defaults below.

use crate::catalog::MAX_NAME_LEN;
use crate::error::Result;
use crate::nvm::Geometry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

pub const DEFAULT_CACHE_PAGES: usize = 64;
pub const DEFAULT_MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FsConfig {
    /// Bytes per page, a power of two
    #[validate(range(min = 64, max = 65536))]
    pub page_size: u32,

    #[validate(range(min = 2, max = 1024))]
    pub pages_per_block: u32,

    /// Two blocks hold metadata, the rest data
    #[validate(range(min = 4))]
    pub block_count: u32,

    /// Free page count that triggers garbage collection before an
    /// allocation. Never below one block; `None` means one block.
    pub gc_low_water: Option<u32>,

    /// Page payloads kept in the read cache (0 disables it)
    #[validate(range(max = 65536))]
    pub cache_pages: usize,

    #[validate(range(min = 1, max = 255))]
    pub max_name_len: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        let geometry = Geometry::default();
        FsConfig {
            page_size: geometry.page_size,
            pages_per_block: geometry.pages_per_block,
            block_count: geometry.block_count,
            gc_low_water: None,
            cache_pages: DEFAULT_CACHE_PAGES,
            max_name_len: DEFAULT_MAX_NAME_LEN,
        }
    }
}

impl FsConfig {
    /// Default configuration for an existing device layout
    pub fn for_geometry(geometry: Geometry) -> Self {
        FsConfig {
            page_size: geometry.page_size,
            pages_per_block: geometry.pages_per_block,
            block_count: geometry.block_count,
            ..Default::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FsConfig = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.page_size, self.pages_per_block, self.block_count)
    }

    /// Free page count below which allocation collects garbage first
    pub fn gc_low_water(&self) -> usize {
        self.gc_low_water
            .unwrap_or(self.pages_per_block)
            .max(self.pages_per_block) as usize
    }

    pub fn max_name_len(&self) -> usize {
        self.max_name_len.min(MAX_NAME_LEN)
    }

    /// Field ranges plus the geometry rules
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        self.geometry().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;

    #[test]
    fn test_default_config() {
        let config = FsConfig::default();
        config.check().unwrap();
        assert_eq!(config.geometry(), Geometry::default());
        assert_eq!(config.gc_low_water(), 16);
    }

    #[test]
    fn test_from_toml() {
        let config = FsConfig::from_toml_str(
            r#"
            page_size = 128
            pages_per_block = 8
            block_count = 10
            gc_low_water = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.geometry(), Geometry::new(128, 8, 10));
        assert_eq!(config.gc_low_water(), 20);
        assert_eq!(config.max_name_len, DEFAULT_MAX_NAME_LEN);
    }

    #[test]
    fn test_low_water_floor() {
        let config = FsConfig {
            gc_low_water: Some(1),
            ..Default::default()
        };
        assert_eq!(config.gc_low_water(), 16);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            FsConfig::from_toml_str("page_size = 32"),
            Err(FsError::Config(_))
        ));
        // In range but not a power of two
        assert!(matches!(
            FsConfig::from_toml_str("page_size = 300"),
            Err(FsError::Config(_))
        ));
        assert!(matches!(
            FsConfig::from_toml_str("max_name_len = 0"),
            Err(FsError::Config(_))
        ));
        assert!(matches!(
            FsConfig::from_toml_str("page_size = \"big\""),
            Err(FsError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvmfs.toml");
        std::fs::write(&path, "block_count = 8\n").unwrap();

        let config = FsConfig::from_file(&path).unwrap();
        assert_eq!(config.block_count, 8);

        assert!(matches!(
            FsConfig::from_file(dir.path().join("missing.toml")),
            Err(FsError::Io(_))
        ));
    }
}
