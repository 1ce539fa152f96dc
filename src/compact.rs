//! Compaction (§4.4): selecting low-fill chunks for rewrite, and selecting
//! trailing chunks to relocate toward the head of the file. The actual
//! rewrite/relocation mechanics live in `store.rs`, since both need mutable
//! access to `chunks`/`meta`/`file_store` together with the commit pipeline;
//! this module only implements the pure ranking/selection math so it can be
//! unit tested in isolation.

use std::collections::BTreeMap;

use crate::chunk::Chunk;

/// Overall fill rate across all stored chunks, treating anything younger
/// than `retention_time_ms` as fully live (young chunks are still being
/// written into by in-flight readers and shouldn't count against
/// compaction's fill-rate target).
pub fn overall_fill_rate(chunks: &BTreeMap<u32, Chunk>, now_ms: u64, retention_time_ms: i64) -> u32 {
    let mut total_max: u128 = 0;
    let mut total_live: u128 = 0;
    for chunk in chunks.values().filter(|c| c.is_stored()) {
        total_max += chunk.max_len as u128;
        if is_young(chunk, now_ms, retention_time_ms) {
            total_live += chunk.max_len as u128;
        } else {
            total_live += chunk.max_len_live.max(0) as u128;
        }
    }
    if total_max == 0 {
        return 100;
    }
    ((total_live * 100) / total_max) as u32
}

fn is_young(chunk: &Chunk, now_ms: u64, retention_time_ms: i64) -> bool {
    if retention_time_ms < 0 {
        return false;
    }
    now_ms < chunk.time + retention_time_ms as u64
}

/// `collectPriority`: older, sparser chunks sort first.
fn priority(chunk: &Chunk, last_version: u64) -> u64 {
    let age = last_version.saturating_sub(chunk.version) + 1;
    (chunk.fill_rate() as u64 * 1000) / age.max(1)
}

/// Rank old (non-young) chunks by ascending priority, tie-broken by
/// ascending live byte count, and return the prefix whose cumulative
/// `max_len_live` reaches `write_bytes`.
pub fn select_chunks_to_rewrite(
    chunks: &BTreeMap<u32, Chunk>,
    now_ms: u64,
    retention_time_ms: i64,
    last_version: u64,
    write_bytes: u64,
) -> Vec<u32> {
    let mut candidates: Vec<&Chunk> = chunks
        .values()
        .filter(|c| c.is_stored() && !is_young(c, now_ms, retention_time_ms))
        .collect();
    candidates.sort_by(|a, b| {
        priority(a, last_version)
            .cmp(&priority(b, last_version))
            .then(a.max_len_live.cmp(&b.max_len_live))
    });

    let mut selected = Vec::new();
    let mut accumulated = 0u64;
    for chunk in candidates {
        if accumulated >= write_bytes {
            break;
        }
        accumulated += chunk.max_len_live.max(0) as u64;
        selected.push(chunk.id);
    }
    selected
}

/// Select trailing chunks (those stored past `first_free_offset`) to relocate,
/// sorted by ascending block, cumulative up to `move_size` — but always
/// keeping the very first selected chunk plus the tail, so a single move
/// pass both closes the first gap and lets the file shrink.
pub fn select_chunks_to_move(chunks: &BTreeMap<u32, Chunk>, first_free_offset: u64, move_size: u64) -> Vec<u32> {
    let mut trailing: Vec<&Chunk> = chunks
        .values()
        .filter(|c| c.is_stored() && c.block > first_free_offset)
        .collect();
    trailing.sort_by_key(|c| c.block);

    if trailing.is_empty() {
        return Vec::new();
    }

    let mut selected = vec![trailing[0].id];
    let mut accumulated = trailing[0].len;
    for chunk in trailing.iter().skip(1) {
        if accumulated >= move_size && chunk.id != trailing.last().unwrap().id {
            continue;
        }
        if !selected.contains(&chunk.id) {
            selected.push(chunk.id);
            accumulated += chunk.len;
        }
    }
    let tail_id = trailing.last().unwrap().id;
    if !selected.contains(&tail_id) {
        selected.push(tail_id);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u32, version: u64, time: u64, max_len: u64, max_len_live: i64, block: u64) -> Chunk {
        let mut c = Chunk::new(id, version, time);
        c.block = block;
        c.len = max_len.max(4096);
        c.max_len = max_len;
        c.max_len_live = max_len_live;
        c
    }

    #[test]
    fn fill_rate_counts_young_chunks_as_fully_live() {
        let mut chunks = BTreeMap::new();
        chunks.insert(1, chunk(1, 0, 1_000_000, 1000, 100, 0));
        let rate = overall_fill_rate(&chunks, 1_000_100, 1_000_000);
        assert_eq!(rate, 100);
    }

    #[test]
    fn sparse_old_chunks_are_selected_first() {
        let mut chunks = BTreeMap::new();
        chunks.insert(1, chunk(1, 0, 0, 1000, 100, 0)); // 10% full, old
        chunks.insert(2, chunk(2, 5, 0, 1000, 900, 4096)); // 90% full, newer
        let selected = select_chunks_to_rewrite(&chunks, 1_000_000, -1, 5, 200);
        assert_eq!(selected, vec![1]);
    }

    #[test]
    fn move_selection_always_keeps_the_tail() {
        let mut chunks = BTreeMap::new();
        chunks.insert(1, chunk(1, 0, 0, 4096, 4096, 100));
        chunks.insert(2, chunk(2, 1, 0, 4096, 4096, 4196));
        chunks.insert(3, chunk(3, 2, 0, 4096, 4096, 8296));
        let selected = select_chunks_to_move(&chunks, 0, 0);
        assert!(selected.contains(&1));
        assert!(selected.contains(&3));
    }
}
