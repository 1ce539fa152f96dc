//! Reachability GC & free-space bookkeeping (§4.3).
//!
//! Because `MvMap`/`Page` are modeled as a single persistent page per map
//! version (see `mvmap.rs`), the reachability walk collapses to one level:
//! every `root.*` entry in a reachable meta snapshot names exactly one
//! chunk, with no further descendants to recurse into. That still matches
//! the narrow contract this module is specified against — "for each
//! `root.{id}` key ... descend the corresponding map's tree" — the tree
//! here just happens to be one page deep.

use std::collections::{BTreeMap, HashSet};

use crate::chunk::Chunk;
use crate::error::StoreError;
use crate::file_store::FileStore;
use crate::frame;
use crate::meta::MetaMap;
use crate::mvmap;
use crate::page::PagePosition;

fn absolute_offset(chunks: &BTreeMap<u32, Chunk>, pos: PagePosition) -> Result<u64, StoreError> {
    let chunk = chunks
        .get(&pos.chunk_id())
        .ok_or(StoreError::ChunkNotFound(pos.chunk_id()))?;
    Ok(chunk.block + pos.offset() as u64)
}

/// Walk the meta map's current root plus previous roots while
/// `version >= oldest_version_to_keep`, recording every chunk transitively
/// referenced by a `root.*` entry in any inspected snapshot.
pub fn collect_referenced_chunks(
    chunks: &BTreeMap<u32, Chunk>,
    file_store: &FileStore,
    oldest_version_to_keep: u64,
) -> Result<HashSet<u32>, StoreError> {
    let mut referenced = HashSet::new();
    let mut ordered: Vec<&Chunk> = chunks.values().filter(|c| c.is_stored()).collect();
    ordered.sort_by(|a, b| b.version.cmp(&a.version));

    for chunk in ordered {
        if chunk.version < oldest_version_to_keep {
            break;
        }
        referenced.insert(chunk.id);
        let meta_pos = chunk.meta_root_pos;
        if !meta_pos.is_saved() {
            continue;
        }
        referenced.insert(meta_pos.chunk_id());
        let offset = absolute_offset(chunks, meta_pos)?;
        let bytes = frame::read_frame(file_store, offset)?;
        let entries = mvmap::deserialize_entries(&bytes)?;
        for (k, v) in entries.iter() {
            let Ok(key) = std::str::from_utf8(k) else { continue };
            if key.strip_prefix("root.").is_none() {
                continue;
            }
            let Ok(value) = std::str::from_utf8(v) else { continue };
            let Ok(raw) = u64::from_str_radix(value, 16) else { continue };
            let pos = PagePosition::from_raw(raw);
            if pos.is_saved() {
                referenced.insert(pos.chunk_id());
            }
        }
    }
    Ok(referenced)
}

/// `canOverwriteChunk`: a chunk may be deleted outright once it has been
/// dead for at least `retention_time_ms` and unreferenced for at least
/// `retention_time_ms / 2` beyond that, unless retention is disabled
/// (`retention_time_ms < 0`), which makes everything immediately collectible.
pub fn can_overwrite_chunk(chunk: &Chunk, now_ms: u64, retention_time_ms: i64) -> bool {
    if retention_time_ms < 0 {
        return true;
    }
    let retention = retention_time_ms as u64;
    now_ms >= chunk.time + retention && chunk.unused != 0 && now_ms >= chunk.unused + retention / 2
}

#[derive(Debug, Default)]
pub struct GcOutcome {
    pub deleted_chunk_ids: Vec<u32>,
    pub newly_dead_chunk_ids: Vec<u32>,
}

/// `freeUnusedChunks`: delete chunks that are both unreferenced and past
/// their retention window; stamp the rest with a death timestamp the first
/// time they're observed unreferenced.
pub fn free_unused_chunks(
    chunks: &mut BTreeMap<u32, Chunk>,
    meta: &mut MetaMap,
    file_store: &mut FileStore,
    oldest_version_to_keep: u64,
    last_chunk_id: Option<u32>,
    retention_time_ms: i64,
    now_ms: u64,
) -> Result<GcOutcome, StoreError> {
    let referenced = collect_referenced_chunks(chunks, file_store, oldest_version_to_keep)?;
    let mut outcome = GcOutcome::default();

    for id in chunks.keys().copied().collect::<Vec<_>>() {
        if referenced.contains(&id) || Some(id) == last_chunk_id {
            continue;
        }
        let overwritable = can_overwrite_chunk(&chunks[&id], now_ms, retention_time_ms);
        if overwritable {
            let chunk = chunks.remove(&id).expect("id was just looked up");
            meta.remove_chunk(id);
            file_store.free(chunk.block, chunk.len);
            outcome.deleted_chunk_ids.push(id);
        } else {
            let chunk = chunks.get_mut(&id).expect("id was just looked up");
            if !chunk.is_unused() {
                chunk.unused = now_ms;
                meta.put_chunk(chunk);
                outcome.newly_dead_chunk_ids.push(id);
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn young_chunk(id: u32, version: u64, time: u64) -> Chunk {
        let mut c = Chunk::new(id, version, time);
        c.block = id as u64 * 4096;
        c.len = 4096;
        c
    }

    #[test]
    fn zero_retention_makes_chunks_immediately_collectible() {
        let mut c = young_chunk(1, 0, 0);
        c.unused = 1;
        assert!(can_overwrite_chunk(&c, 1, 0));
    }

    #[test]
    fn negative_retention_disables_timeout() {
        let c = young_chunk(1, 0, 1_000_000);
        assert!(can_overwrite_chunk(&c, 0, -1));
    }

    #[test]
    fn chunk_not_yet_dead_is_not_overwritable() {
        let c = young_chunk(1, 0, 0);
        assert!(!can_overwrite_chunk(&c, 10_000, 1000));
    }
}
