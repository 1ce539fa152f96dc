//! `FileStore`: the block device collaborator.
//!
//! Offers positional read/write, a free-space allocator, fill-rate
//! reporting, sync/truncate, and a tracked file length — the narrow
//! contract the design calls out in §1. Backed by a single growable memory
//! map, following the teacher's `StorageInner` pattern of holding an
//! `MmapMut` and remapping on growth rather than re-opening the file.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use fs4::fs_std::FileExt;
use memmap2::MmapMut;

use crate::error::StoreError;

pub const BLOCK_SIZE: usize = 4096;

/// A single contiguous run of free blocks, tracked by byte offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreeRun {
    offset: u64,
    len: u64,
}

/// The block device backing a `Store`. Not `Sync`-shared directly; `Store`
/// wraps it in its own mutex per the locking discipline in §5.
pub struct FileStore {
    file: Option<File>,
    map: MmapMut,
    /// Free-space bitmap, modeled as a coalesced run list rather than a
    /// literal bitmap: cheap to rebuild during recovery (§4.1 step 5) and to
    /// query for "does this hole still exist" during compaction moves.
    free: BTreeMap<u64, u64>,
    /// One past the highest byte ever handed out by `allocate`/`append`.
    length_in_use: u64,
    read_only: bool,
}

impl FileStore {
    /// Open (or create) a file-backed store, reserving `initial_len` bytes
    /// of address space up front. `initial_len` must already be a multiple
    /// of `BLOCK_SIZE`.
    pub fn open(path: impl AsRef<Path>, initial_len: u64, read_only: bool) -> Result<Self, StoreError> {
        let os_page_size = page_size::get() as u64;
        if BLOCK_SIZE as u64 % os_page_size != 0 {
            return Err(StoreError::UnsupportedFormat(format!(
                "block size {BLOCK_SIZE} is not a multiple of the OS page size {os_page_size}"
            )));
        }

        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)?;
        // Exclusive lock for the process lifetime of this handle: a second
        // `FileStore::open` against the same path (in this process or
        // another) must fail fast rather than silently race writes.
        if read_only {
            file.try_lock_shared().map_err(|e| StoreError::Locked(e.to_string()))?;
        } else {
            file.try_lock_exclusive().map_err(|e| StoreError::Locked(e.to_string()))?;
        }
        let existing_len = file.metadata()?.len();
        let want_len = existing_len.max(initial_len).max(BLOCK_SIZE as u64 * 2);
        if want_len > existing_len {
            file.set_len(want_len)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let length_in_use = existing_len.max(BLOCK_SIZE as u64 * 2);
        let mut free = BTreeMap::new();
        if want_len > length_in_use {
            free.insert(length_in_use, want_len - length_in_use);
        }
        Ok(Self {
            file: Some(file),
            map,
            free,
            length_in_use,
            read_only,
        })
    }

    /// Construct an in-memory-only store (no backing file), for tests.
    pub fn anonymous(initial_len: u64) -> Result<Self, StoreError> {
        let map = MmapMut::map_anon(initial_len as usize)?;
        Ok(Self {
            file: None,
            map,
            free: BTreeMap::new(),
            length_in_use: BLOCK_SIZE as u64 * 2,
            read_only: false,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn length_in_use(&self) -> u64 {
        self.length_in_use
    }

    pub fn capacity(&self) -> u64 {
        self.map.len() as u64
    }

    fn ensure_capacity(&mut self, needed: u64) -> Result<(), StoreError> {
        if needed <= self.map.len() as u64 {
            return Ok(());
        }
        let new_len = (needed * 2).max(needed + BLOCK_SIZE as u64 * 16);
        if let Some(file) = self.file.as_ref() {
            file.set_len(new_len)?;
            self.map = unsafe { MmapMut::map_mut(file)? };
        } else {
            let mut new_map = MmapMut::map_anon(new_len as usize)?;
            new_map[..self.map.len()].copy_from_slice(&self.map[..]);
            self.map = new_map;
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| StoreError::corrupt("read range overflowed"))?;
        if end > self.map.len() as u64 {
            return Err(StoreError::corrupt(format!(
                "read out of bounds: offset={offset} len={len} capacity={}",
                self.map.len()
            )));
        }
        Ok(self.map[offset as usize..end as usize].to_vec())
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::WritingFailed("store is read-only".into()));
        }
        let end = offset + data.len() as u64;
        self.ensure_capacity(end)?;
        self.map[offset as usize..end as usize].copy_from_slice(data);
        self.length_in_use = self.length_in_use.max(end);
        Ok(())
    }

    /// Round `len` up to a block boundary.
    pub fn round_up_to_block(len: u64) -> u64 {
        let bs = BLOCK_SIZE as u64;
        (len + bs - 1) / bs * bs
    }

    /// Allocate `len` bytes, preferring a free-list hole (`reuse_space`) or
    /// always appending at end-of-file.
    pub fn allocate(&mut self, len: u64, reuse_space: bool) -> Result<u64, StoreError> {
        let len = Self::round_up_to_block(len);
        if reuse_space {
            if let Some(offset) = self.take_free_run(len) {
                return Ok(offset);
            }
        }
        self.append_space(len)
    }

    pub fn append(&mut self, len: u64) -> Result<u64, StoreError> {
        let len = Self::round_up_to_block(len);
        self.append_space(len)
    }

    fn append_space(&mut self, len: u64) -> Result<u64, StoreError> {
        let offset = self.length_in_use;
        self.ensure_capacity(offset + len)?;
        self.length_in_use += len;
        Ok(offset)
    }

    fn take_free_run(&mut self, len: u64) -> Option<u64> {
        let found = self
            .free
            .iter()
            .find(|(_, &run_len)| run_len >= len)
            .map(|(&offset, &run_len)| (offset, run_len));
        let (offset, run_len) = found?;
        self.free.remove(&offset);
        if run_len > len {
            self.free.insert(offset + len, run_len - len);
        }
        Some(offset)
    }

    /// Mark `[offset, offset+len)` as free, coalescing with adjacent runs.
    pub fn free(&mut self, offset: u64, len: u64) {
        let len = Self::round_up_to_block(len);
        let mut start = offset;
        let mut total_len = len;

        // Merge with a preceding run that ends exactly at `start`.
        if let Some((&prev_off, &prev_len)) = self.free.range(..start).next_back() {
            if prev_off + prev_len == start {
                self.free.remove(&prev_off);
                start = prev_off;
                total_len += prev_len;
            }
        }
        // Merge with a following run that starts exactly at our end.
        let end = start + total_len;
        if let Some((&next_off, &next_len)) = self.free.range(end..).next() {
            if next_off == end {
                self.free.remove(&next_off);
                total_len += next_len;
            }
        }
        self.free.insert(start, total_len);
    }

    /// Fraction of bytes under `length_in_use` that are *not* free, as a
    /// percentage. Used by `compactMoveChunks` to decide whether a move pass
    /// is warranted at all.
    pub fn fill_rate(&self) -> u32 {
        if self.length_in_use == 0 {
            return 100;
        }
        let free: u64 = self.free.values().copied().sum();
        let used = self.length_in_use.saturating_sub(free);
        ((used as u128 * 100) / self.length_in_use as u128) as u32
    }

    pub fn highest_free_run_start(&self) -> Option<u64> {
        self.free.keys().next().copied()
    }

    /// Shrink the file if the free space at the tail is at least `min_blocks`
    /// blocks and at least 1% of the file, per the commit pipeline's
    /// end-of-`storeNow` bookkeeping.
    pub fn shrink_if_possible(&mut self, min_blocks: u64) -> Result<bool, StoreError> {
        let Some((&tail_offset, &tail_len)) = self.free.range(..).next_back().filter(|(o, l)| o + *l == self.length_in_use) else {
            return Ok(false);
        };
        if tail_len < min_blocks * BLOCK_SIZE as u64 {
            return Ok(false);
        }
        if (tail_len as u128 * 100) < (self.length_in_use as u128) {
            return Ok(false);
        }
        self.free.remove(&tail_offset);
        self.length_in_use = tail_offset;
        if let Some(file) = self.file.as_ref() {
            file.set_len(self.length_in_use.max(BLOCK_SIZE as u64 * 2))?;
        }
        Ok(true)
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.map.flush()?;
        if let Some(file) = self.file.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn truncate(&mut self, new_len: u64) -> Result<(), StoreError> {
        self.length_in_use = new_len;
        self.free.retain(|&offset, _| offset < new_len);
        if let Some((&offset, &len)) = self.free.iter().find(|(&o, &l)| o < new_len && o + l > new_len) {
            self.free.insert(offset, new_len - offset);
            let _ = len;
        }
        if let Some(file) = self.file.as_ref() {
            file.set_len(new_len.max(BLOCK_SIZE as u64 * 2))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_reuses_freed_space() {
        let mut fs = FileStore::anonymous(BLOCK_SIZE as u64 * 16).unwrap();
        let a = fs.append(BLOCK_SIZE as u64).unwrap();
        let b = fs.append(BLOCK_SIZE as u64).unwrap();
        fs.free(a, BLOCK_SIZE as u64);
        let c = fs.allocate(BLOCK_SIZE as u64, true).unwrap();
        assert_eq!(c, a);
        assert_ne!(b, c);
    }

    #[test]
    fn fill_rate_reflects_free_runs() {
        let mut fs = FileStore::anonymous(BLOCK_SIZE as u64 * 16).unwrap();
        fs.append(BLOCK_SIZE as u64 * 4).unwrap();
        assert_eq!(fs.fill_rate(), 100);
        fs.free(0, BLOCK_SIZE as u64 * 2);
        assert_eq!(fs.fill_rate(), 50);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut fs = FileStore::anonymous(BLOCK_SIZE as u64 * 4).unwrap();
        let off = fs.append(BLOCK_SIZE as u64).unwrap();
        fs.write(off, b"hello").unwrap();
        assert_eq!(&fs.read(off, 5).unwrap(), b"hello");
    }
}
