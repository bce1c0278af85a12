//! Free-page bitmap
//!
//! One bit per data page:
//! - 0 = free (erased, ready to program)
//! - 1 = taken (pending, used, stale or bad)

use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageBitmap {
    /// Bitmap words (each word = 64 bits = 64 pages)
    bitmap: Vec<u64>,

    /// Total number of pages tracked
    total: usize,

    /// Number of free pages
    free: usize,
}

impl PageBitmap {
    /// Create a bitmap with every page free
    pub fn new(total: usize) -> Self {
        let num_words = (total + 63) / 64;
        PageBitmap {
            bitmap: vec![0u64; num_words],
            total,
            free: total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Check if a specific page is taken
    pub fn is_taken(&self, index: usize) -> bool {
        if index >= self.total {
            return false;
        }
        (self.bitmap[index / 64] & (1u64 << (index % 64))) != 0
    }

    /// Mark a page taken. Returns false if it already was.
    pub fn take(&mut self, index: usize) -> bool {
        if index >= self.total || self.is_taken(index) {
            return false;
        }
        self.bitmap[index / 64] |= 1u64 << (index % 64);
        self.free -= 1;
        true
    }

    /// Mark a page free. Returns false if it already was.
    pub fn release(&mut self, index: usize) -> bool {
        if index >= self.total || !self.is_taken(index) {
            return false;
        }
        self.bitmap[index / 64] &= !(1u64 << (index % 64));
        self.free += 1;
        true
    }

    /// First free page at or after `start`, wrapping around, skipping any
    /// page inside `exclude`.
    pub fn find_free_from(&self, start: usize, exclude: Option<Range<usize>>) -> Option<usize> {
        if self.free == 0 || self.total == 0 {
            return None;
        }

        let start = start % self.total;
        let excluded = |i: usize| exclude.as_ref().map_or(false, |r| r.contains(&i));

        let mut index = start;
        let mut visited = 0;
        while visited < self.total {
            let word = self.bitmap[index / 64];
            if word == u64::MAX {
                // Whole word taken, jump to the next one
                let next = (index / 64 + 1) * 64;
                visited += next - index;
                index = next;
            } else {
                if word & (1u64 << (index % 64)) == 0 && !excluded(index) {
                    return Some(index);
                }
                visited += 1;
                index += 1;
            }

            if index >= self.total {
                index = 0;
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_creation() {
        let map = PageBitmap::new(1000);
        assert_eq!(map.total(), 1000);
        assert_eq!(map.free_count(), 1000);
    }

    #[test]
    fn test_take_and_release() {
        let mut map = PageBitmap::new(100);

        assert!(map.take(10));
        assert!(!map.take(10));
        assert!(map.is_taken(10));
        assert_eq!(map.free_count(), 99);

        assert!(map.release(10));
        assert!(!map.release(10));
        assert_eq!(map.free_count(), 100);
    }

    #[test]
    fn test_out_of_range() {
        let mut map = PageBitmap::new(10);
        assert!(!map.take(10));
        assert!(!map.is_taken(1000));
        assert_eq!(map.free_count(), 10);
    }

    #[test]
    fn test_find_free_wraps() {
        let mut map = PageBitmap::new(130);
        for i in 0..130 {
            if i != 5 {
                map.take(i);
            }
        }

        assert_eq!(map.find_free_from(100, None), Some(5));
        assert_eq!(map.find_free_from(5, None), Some(5));
        assert_eq!(map.find_free_from(6, None), Some(5));
    }

    #[test]
    fn test_find_free_exclude() {
        let mut map = PageBitmap::new(16);
        for i in 8..16 {
            map.take(i);
        }

        assert_eq!(map.find_free_from(0, Some(0..4)), Some(4));
        assert_eq!(map.find_free_from(0, Some(0..8)), None);
    }

    #[test]
    fn test_find_free_full() {
        let mut map = PageBitmap::new(64);
        for i in 0..64 {
            map.take(i);
        }
        assert_eq!(map.find_free_from(17, None), None);
    }
}
