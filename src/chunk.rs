//! Chunks: the append-only, immutable (after first write) units of on-disk
//! storage described in §3 and §6.

use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::header::fletcher32;
use crate::page::{PagePosition, MAX_CHUNK_ID};

/// Sentinel `block` value for a chunk that has been allocated an id but not
/// yet actually stored (see `storeNow` step 3's panic condition).
pub const UNSTORED_SENTINEL: u64 = u64::MAX;

/// Length, in bytes, reserved at the end of a chunk for its footer record.
pub const FOOTER_LENGTH: usize = 128;

/// Length, in bytes, reserved at the start of a chunk for its own
/// self-descriptive header (the same field set as the `chunk.{id}` meta
/// entry, but written directly into the chunk so recovery can read a
/// candidate chunk's true `metaRoot`/`next`/`len` without first having to
/// load the metadata map it is itself bootstrapping from).
pub const HEADER_LENGTH: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: u32,
    pub block: u64,
    pub len: u64,
    pub version: u64,
    pub time: u64,
    pub page_count: u32,
    pub page_count_live: i64,
    pub max_len: u64,
    pub max_len_live: i64,
    pub meta_root_pos: PagePosition,
    pub next: u64,
    pub unused: u64,
    pub map_id: u32,
}

impl Chunk {
    pub fn new(id: u32, version: u64, time: u64) -> Self {
        Self {
            id,
            block: UNSTORED_SENTINEL,
            len: 0,
            version,
            time,
            page_count: 0,
            page_count_live: 0,
            max_len: 0,
            max_len_live: 0,
            meta_root_pos: PagePosition::UNSAVED,
            next: 0,
            unused: 0,
            map_id: 0,
        }
    }

    pub fn is_stored(&self) -> bool {
        self.block != UNSTORED_SENTINEL
    }

    /// True once this chunk has no live pages left and hasn't been referenced
    /// since. Per invariant 6, `unused == 0` always means "still live".
    pub fn is_unused(&self) -> bool {
        self.unused != 0
    }

    /// Coerce transient negative live-counters back to zero (invariant 4:
    /// negatives are only permitted transiently in `[-MARKED_FREE, 0)`).
    pub fn clamp_live_counters(&mut self) {
        if self.page_count_live < 0 {
            self.page_count_live = 0;
        }
        if self.max_len_live < 0 {
            self.max_len_live = 0;
        }
    }

    pub fn fill_rate(&self) -> u32 {
        if self.max_len == 0 {
            return 100;
        }
        ((self.max_len_live.max(0) as u64 * 100) / self.max_len) as u32
    }

    fn to_fields(&self) -> BTreeMap<&'static str, String> {
        let mut m = BTreeMap::new();
        m.insert("chunk", format!("{:x}", self.id));
        m.insert("block", format!("{:x}", self.block));
        m.insert("len", format!("{:x}", self.len));
        m.insert("pages", format!("{:x}", self.page_count));
        m.insert("max", format!("{:x}", self.max_len));
        m.insert("maxLive", format!("{:x}", self.max_len_live.max(0)));
        m.insert("metaRoot", format!("{:x}", self.meta_root_pos.raw()));
        m.insert("next", format!("{:x}", self.next));
        m.insert("version", format!("{:x}", self.version));
        m.insert("time", format!("{:x}", self.time));
        m.insert("mapId", format!("{:x}", self.map_id));
        m.insert("unused", format!("{:x}", self.unused));
        m
    }

    /// Encode the `chunk.{hex id}` metadata value: a single-line ASCII map,
    /// matching the store header's field-encoding idiom.
    pub fn encode_meta_value(&self) -> String {
        self.to_fields()
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn decode_meta_value(s: &str) -> Result<Self, StoreError> {
        let mut fields = BTreeMap::new();
        for part in s.split(',') {
            if part.is_empty() {
                continue;
            }
            let (k, v) = part
                .split_once(':')
                .ok_or_else(|| StoreError::corrupt(format!("malformed chunk field {part}")))?;
            fields.insert(k, v);
        }
        let get_hex_u64 = |k: &str| -> Result<u64, StoreError> {
            let v = fields
                .get(k)
                .ok_or_else(|| StoreError::corrupt(format!("chunk meta missing {k}")))?;
            u64::from_str_radix(v, 16).map_err(|_| StoreError::corrupt(format!("chunk meta field {k} is not hex")))
        };
        Ok(Chunk {
            id: get_hex_u64("chunk")? as u32,
            block: get_hex_u64("block")?,
            len: get_hex_u64("len")?,
            version: get_hex_u64("version")?,
            time: get_hex_u64("time")?,
            page_count: get_hex_u64("pages")? as u32,
            page_count_live: get_hex_u64("pages")? as i64,
            max_len: get_hex_u64("max")?,
            max_len_live: get_hex_u64("maxLive")? as i64,
            meta_root_pos: PagePosition::from_raw(get_hex_u64("metaRoot")?),
            next: get_hex_u64("next")?,
            unused: fields.get("unused").map_or(Ok(0), |v| {
                u64::from_str_radix(v, 16).map_err(|_| StoreError::corrupt("chunk meta field unused is not hex"))
            })?,
            map_id: get_hex_u64("mapId")? as u32,
        })
    }

    /// Encode the on-disk self-header: the full field set plus a checksum,
    /// zero-padded to `HEADER_LENGTH`. Written once at chunk-creation time
    /// with final values, so it never needs patching after the fact.
    pub fn encode_header(&self) -> Result<Vec<u8>, StoreError> {
        let body = format!("{}\n", self.encode_meta_value());
        let checksum = fletcher32(body.as_bytes());
        let mut out = body.into_bytes();
        out.extend_from_slice(format!("fletcher:{checksum:08x}\n").as_bytes());
        if out.len() > HEADER_LENGTH {
            return Err(StoreError::internal("chunk header overflowed its fixed window"));
        }
        out.resize(HEADER_LENGTH, 0);
        Ok(out)
    }

    pub fn decode_header(bytes: &[u8]) -> Result<Self, StoreError> {
        let text = std::str::from_utf8(bytes).map_err(|_| StoreError::corrupt("chunk header not utf8"))?;
        let nul = text.find('\0').unwrap_or(text.len());
        let text = &text[..nul];
        let mut lines = text.lines();
        let body_line = lines.next().ok_or_else(|| StoreError::corrupt("empty chunk header"))?;
        let checksum_line = lines.next().ok_or_else(|| StoreError::corrupt("chunk header missing checksum"))?;
        let expected: u32 = u32::from_str_radix(
            checksum_line
                .strip_prefix("fletcher:")
                .ok_or_else(|| StoreError::corrupt("chunk header missing fletcher field"))?,
            16,
        )
        .map_err(|_| StoreError::corrupt("chunk header fletcher not hex"))?;
        let actual = fletcher32(format!("{body_line}\n").as_bytes());
        if actual != expected {
            return Err(StoreError::corrupt("chunk header checksum mismatch"));
        }
        Self::decode_meta_value(body_line)
    }

    /// Encode the on-disk footer: restates `chunk`, `block`, `version`, plus
    /// a checksum over those three fields, zero-padded to `FOOTER_LENGTH`.
    pub fn encode_footer(&self) -> Vec<u8> {
        let body = format!("chunk:{:x},block:{:x},version:{:x}\n", self.id, self.block, self.version);
        let checksum = fletcher32(body.as_bytes());
        let mut out = body.into_bytes();
        out.extend_from_slice(format!("fletcher:{checksum:08x}\n").as_bytes());
        out.resize(FOOTER_LENGTH, 0);
        out
    }

    pub fn decode_footer(bytes: &[u8]) -> Result<(u32, u64, u64), StoreError> {
        let text = std::str::from_utf8(bytes).map_err(|_| StoreError::corrupt("footer not utf8"))?;
        let nul = text.find('\0').unwrap_or(text.len());
        let text = &text[..nul];
        let mut lines = text.lines();
        let body_line = lines.next().ok_or_else(|| StoreError::corrupt("empty footer"))?;
        let checksum_line = lines.next().ok_or_else(|| StoreError::corrupt("footer missing checksum"))?;
        let expected: u32 = u32::from_str_radix(
            checksum_line
                .strip_prefix("fletcher:")
                .ok_or_else(|| StoreError::corrupt("footer missing fletcher field"))?,
            16,
        )
        .map_err(|_| StoreError::corrupt("footer fletcher not hex"))?;
        let actual = fletcher32(format!("{body_line}\n").as_bytes());
        if actual != expected {
            return Err(StoreError::corrupt("footer checksum mismatch"));
        }
        let mut chunk = None;
        let mut block = None;
        let mut version = None;
        for part in body_line.split(',') {
            let (k, v) = part
                .split_once(':')
                .ok_or_else(|| StoreError::corrupt("malformed footer field"))?;
            match k {
                "chunk" => chunk = Some(u32::from_str_radix(v, 16).map_err(|_| StoreError::corrupt("bad footer chunk"))?),
                "block" => block = Some(u64::from_str_radix(v, 16).map_err(|_| StoreError::corrupt("bad footer block"))?),
                "version" => version = Some(u64::from_str_radix(v, 16).map_err(|_| StoreError::corrupt("bad footer version"))?),
                _ => {}
            }
        }
        Ok((
            chunk.ok_or_else(|| StoreError::corrupt("footer missing chunk"))?,
            block.ok_or_else(|| StoreError::corrupt("footer missing block"))?,
            version.ok_or_else(|| StoreError::corrupt("footer missing version"))?,
        ))
    }
}

/// Allocate the next chunk id: `(last_id + 1) & MAX_ID`, skipping any id
/// still live in `chunks`. Per storeNow step 3, finding a skipped slot whose
/// `block == UNSTORED_SENTINEL` means a previous commit died mid-allocation;
/// that is an internal invariant violation, not a retryable condition.
pub fn alloc_next_chunk_id(last_id: u32, chunks: &BTreeMap<u32, Chunk>) -> Result<u32, StoreError> {
    let mut candidate = last_id.wrapping_add(1) & MAX_CHUNK_ID;
    if candidate == 0 {
        candidate = 1; // id 0 is reserved, see PagePosition's unsaved sentinel.
    }
    loop {
        match chunks.get(&candidate) {
            None => return Ok(candidate),
            Some(c) if c.block == UNSTORED_SENTINEL => {
                return Err(StoreError::internal(format!(
                    "chunk id {candidate} was allocated but never stored by a previous commit"
                )));
            }
            Some(_) => {
                candidate = candidate.wrapping_add(1) & MAX_CHUNK_ID;
                if candidate == 0 {
                    candidate = 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_value_round_trips() {
        let mut c = Chunk::new(5, 10, 1234);
        c.block = 8192;
        c.len = 4096;
        c.page_count = 3;
        c.max_len = 900;
        c.max_len_live = 400;
        c.next = 12288;
        c.map_id = 2;
        let encoded = c.encode_meta_value();
        let decoded = Chunk::decode_meta_value(&encoded).unwrap();
        assert_eq!(decoded.id, c.id);
        assert_eq!(decoded.block, c.block);
        assert_eq!(decoded.max_len_live, c.max_len_live);
    }

    #[test]
    fn self_header_round_trips() {
        let mut c = Chunk::new(3, 1, 500);
        c.block = 8192;
        c.len = 4096;
        c.max_len = 900;
        c.max_len_live = 400;
        c.meta_root_pos = PagePosition::new(3, 600, 2, crate::page::PageKind::Leaf);
        let header = c.encode_header().unwrap();
        assert_eq!(header.len(), HEADER_LENGTH);
        let decoded = Chunk::decode_header(&header).unwrap();
        assert_eq!(decoded.id, c.id);
        assert_eq!(decoded.meta_root_pos, c.meta_root_pos);
    }

    #[test]
    fn footer_round_trips() {
        let mut c = Chunk::new(9, 3, 0);
        c.block = 4096;
        let footer = c.encode_footer();
        assert_eq!(footer.len(), FOOTER_LENGTH);
        let (id, block, version) = Chunk::decode_footer(&footer).unwrap();
        assert_eq!(id, 9);
        assert_eq!(block, 4096);
        assert_eq!(version, 3);
    }

    #[test]
    fn id_allocation_skips_live_ids_and_wraps() {
        let mut chunks = BTreeMap::new();
        chunks.insert(2, Chunk::new(2, 0, 0));
        let next = alloc_next_chunk_id(1, &chunks).unwrap();
        assert_eq!(next, 3);

        let wrapped = alloc_next_chunk_id(MAX_CHUNK_ID, &BTreeMap::new()).unwrap();
        assert_eq!(wrapped, 1);
    }

    #[test]
    fn id_allocation_rejects_unstored_sentinel() {
        let mut chunks = BTreeMap::new();
        chunks.insert(2, Chunk::new(2, 0, 0)); // block is UNSTORED_SENTINEL by default
        let err = alloc_next_chunk_id(1, &chunks);
        assert!(matches!(err, Err(StoreError::Internal(_))));
    }
}
