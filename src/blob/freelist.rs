//! In-page freelist maintenance. All three operations are no-ops on
//! multi-page runs, whose slot array is reserved for the payload checksum.

use tracing::warn;

use super::layout::BlobPageHeader;
use crate::error::{Result, UmbraError};

impl BlobPageHeader {
    /// Takes a free range of exactly or at least `size` bytes. A larger
    /// range keeps its tail in the same slot; no slot splitting happens.
    /// Returns the page-relative offset of the carved range.
    pub fn alloc_from_freelist(&mut self, size: u32) -> Option<u32> {
        if self.is_multi_page() {
            return None;
        }

        for slot in self.freelist.iter_mut() {
            if slot.size == size {
                let offset = slot.offset;
                slot.clear();
                return Some(offset);
            }
            if slot.size > size {
                let offset = slot.offset;
                slot.offset += size;
                slot.size -= size;
                return Some(offset);
            }
        }

        None
    }

    /// Returns the range `[offset, offset + size)` to the freelist: merge
    /// with an adjacent slot if one exists, else take an empty slot, else
    /// evict the smallest slot when the new range is strictly larger. A
    /// range that loses the eviction test is dropped; the leak is bounded
    /// by the slot count.
    pub fn add_to_freelist(&mut self, offset: u32, size: u32) {
        if self.is_multi_page() {
            return;
        }

        for slot in self.freelist.iter_mut() {
            if offset + size == slot.offset {
                slot.offset = offset;
                slot.size += size;
                return;
            }
            if slot.offset + slot.size == offset {
                slot.size += size;
                return;
            }
        }

        let mut smallest = 0;
        let mut empty = None;
        for (i, slot) in self.freelist.iter().enumerate() {
            if slot.is_empty() {
                empty = Some(i);
                break;
            }
            if slot.size < self.freelist[smallest].size {
                smallest = i;
            }
        }

        if let Some(i) = empty {
            self.freelist[i].offset = offset;
            self.freelist[i].size = size;
            return;
        }

        if size > self.freelist[smallest].size {
            self.freelist[smallest].offset = offset;
            self.freelist[smallest].size = size;
        }
    }

    /// Structural validation of the header against its page run. Slot
    /// overlap and accounting drift are hard violations.
    pub fn check_integrity(&self, page_size: u32) -> Result<()> {
        if self.num_pages == 0 {
            return Err(UmbraError::IntegrityViolated("blob page run is empty"));
        }

        let span = self.num_pages as u64 * page_size as u64;
        if self.free_bytes as u64 + super::layout::PAGE_OVERHEAD as u64 > span {
            warn!(
                free_bytes = self.free_bytes,
                num_pages = self.num_pages,
                "freelist.free_bytes_exceed_page_run"
            );
            return Err(UmbraError::IntegrityViolated(
                "free bytes exceed page boundary",
            ));
        }

        if self.is_multi_page() {
            return Ok(());
        }

        let mut total: u64 = 0;
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for slot in self.freelist.iter() {
            if slot.is_empty() {
                continue;
            }
            total += slot.size as u64;
            ranges.push((slot.offset, slot.size));
        }

        if total > self.free_bytes as u64 {
            return Err(UmbraError::IntegrityViolated(
                "freelist slots exceed free bytes",
            ));
        }

        ranges.sort_unstable();
        for (i, &(offset, size)) in ranges.iter().enumerate() {
            if offset as u64 + size as u64 > span {
                return Err(UmbraError::IntegrityViolated(
                    "freelist slot exceeds page boundary",
                ));
            }
            if let Some(&(next_offset, _)) = ranges.get(i + 1) {
                if offset + size > next_offset {
                    warn!(offset, size, next_offset, "freelist.slot_overlap");
                    return Err(UmbraError::IntegrityViolated("freelist slots overlap"));
                }
            }
        }

        Ok(())
    }
}
