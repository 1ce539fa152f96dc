//! The store header: a small ASCII key/value record, Fletcher-32 checksummed,
//! written twice into the first two `BLOCK_SIZE` blocks of the file (§4.1,
//! §6). Two copies exist so that opening can always find one coherent header
//! even if the process died mid-write to the other.

use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::file_store::BLOCK_SIZE;

pub const FORMAT_WRITE: u32 = 1;
pub const FORMAT_READ: u32 = 1;
pub const HEADER_MAJOR: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub h: u32,
    pub block_size: u32,
    pub format: u32,
    pub format_read: u32,
    pub created: u64,
    pub chunk: u32,
    pub block: u64,
    pub version: u64,
}

impl StoreHeader {
    pub fn new(created: u64) -> Self {
        Self {
            h: HEADER_MAJOR,
            block_size: BLOCK_SIZE as u32,
            format: FORMAT_WRITE,
            format_read: FORMAT_READ,
            created,
            chunk: 0,
            block: 0,
            version: 0,
        }
    }

    fn to_map(&self) -> BTreeMap<&'static str, String> {
        let mut m = BTreeMap::new();
        m.insert("H", self.h.to_string());
        m.insert("blockSize", self.block_size.to_string());
        m.insert("format", self.format.to_string());
        m.insert("formatRead", self.format_read.to_string());
        m.insert("created", format!("{:x}", self.created));
        m.insert("chunk", format!("{:x}", self.chunk));
        m.insert("block", format!("{:x}", self.block));
        m.insert("version", format!("{:x}", self.version));
        m
    }

    /// Serialize one copy (without checksum framing) as `key:value,key:value\n`.
    fn encode_body(&self) -> String {
        let map = self.to_map();
        let mut s = map
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(",");
        s.push('\n');
        s
    }

    /// Render one `BLOCK_SIZE` block: body, then `fletcher:<hex>\n`, then
    /// zero padding to fill the block.
    fn encode_block(&self) -> Vec<u8> {
        let body = self.encode_body();
        let checksum = fletcher32(body.as_bytes());
        let mut out = body.into_bytes();
        out.extend_from_slice(format!("fletcher:{checksum:08x}\n").as_bytes());
        out.resize(BLOCK_SIZE, 0);
        out
    }

    /// Encode both copies into one contiguous `2 * BLOCK_SIZE` buffer so the
    /// caller can write them in a single call, matching the requirement that
    /// both copies land "atomically from the implementer's perspective".
    pub fn encode_both(&self) -> Vec<u8> {
        let mut buf = self.encode_block();
        buf.extend_from_slice(&self.encode_block());
        buf
    }

    /// Parse one block's worth of bytes, validating its checksum.
    pub fn decode_block(block: &[u8]) -> Result<Self, StoreError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| StoreError::corrupt("store header is not valid UTF-8"))?;
        let nul = text.find('\0').unwrap_or(text.len());
        let text = &text[..nul];
        let (body_part, checksum_line) = split_last_line(text)
            .ok_or_else(|| StoreError::corrupt("store header missing checksum line"))?;
        let checksum_str = checksum_line
            .strip_prefix("fletcher:")
            .ok_or_else(|| StoreError::corrupt("store header missing fletcher field"))?;
        let expected = u32::from_str_radix(checksum_str.trim(), 16)
            .map_err(|_| StoreError::corrupt("store header fletcher field is not hex"))?;
        let actual = fletcher32(body_part.as_bytes());
        if actual != expected {
            return Err(StoreError::corrupt("store header checksum mismatch"));
        }
        let fields = parse_map(body_part.trim_end_matches('\n'))?;
        let get = |k: &str| -> Result<&String, StoreError> {
            fields
                .get(k)
                .ok_or_else(|| StoreError::corrupt(format!("store header missing key {k}")))
        };
        let h: u32 = get("H")?.parse().map_err(|_| StoreError::corrupt("bad H"))?;
        let block_size: u32 = get("blockSize")?.parse().map_err(|_| StoreError::corrupt("bad blockSize"))?;
        let format: u32 = get("format")?.parse().map_err(|_| StoreError::corrupt("bad format"))?;
        let format_read: u32 = get("formatRead")?.parse().map_err(|_| StoreError::corrupt("bad formatRead"))?;
        let created = u64::from_str_radix(get("created")?, 16).map_err(|_| StoreError::corrupt("bad created"))?;
        let chunk = u32::from_str_radix(get("chunk")?, 16).map_err(|_| StoreError::corrupt("bad chunk"))?;
        let block = u64::from_str_radix(get("block")?, 16).map_err(|_| StoreError::corrupt("bad block"))?;
        let version = u64::from_str_radix(get("version")?, 16).map_err(|_| StoreError::corrupt("bad version"))?;
        Ok(Self {
            h,
            block_size,
            format,
            format_read,
            created,
            chunk,
            block,
            version,
        })
    }
}

fn split_last_line(text: &str) -> Option<(&str, &str)> {
    let trimmed = text.trim_end_matches('\0');
    let trimmed = trimmed.strip_suffix('\n').unwrap_or(trimmed);
    let idx = trimmed.rfind('\n')?;
    Some((&text[..idx + 1], &trimmed[idx + 1..]))
}

fn parse_map(s: &str) -> Result<BTreeMap<String, String>, StoreError> {
    let mut m = BTreeMap::new();
    for part in s.split(',') {
        if part.is_empty() {
            continue;
        }
        let (k, v) = part
            .split_once(':')
            .ok_or_else(|| StoreError::corrupt(format!("malformed header field {part}")))?;
        m.insert(k.to_string(), v.to_string());
    }
    Ok(m)
}

/// Fletcher-32 checksum over a byte slice, treated as a stream of
/// little-endian 16-bit words (an odd trailing byte is zero-padded).
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0xffff;
    let mut sum2: u32 = 0xffff;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        let word = u16::from_le_bytes([pair[0], pair[1]]) as u32;
        sum1 = (sum1 + word) % 0xffff;
        sum2 = (sum2 + sum1) % 0xffff;
    }
    if let [last] = chunks.remainder() {
        let word = *last as u32;
        sum1 = (sum1 + word) % 0xffff;
        sum2 = (sum2 + sum1) % 0xffff;
    }
    (sum2 << 16) | sum1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut h = StoreHeader::new(1000);
        h.chunk = 3;
        h.block = 5;
        h.version = 7;
        let both = h.encode_both();
        assert_eq!(both.len(), BLOCK_SIZE * 2);
        let copy0 = StoreHeader::decode_block(&both[..BLOCK_SIZE]).unwrap();
        let copy1 = StoreHeader::decode_block(&both[BLOCK_SIZE..]).unwrap();
        assert_eq!(copy0, h);
        assert_eq!(copy1, h);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let h = StoreHeader::new(1);
        let mut block = h.encode_block();
        block[0] ^= 0xff;
        assert!(StoreHeader::decode_block(&block).is_err());
    }

    #[test]
    fn fletcher32_matches_known_vector() {
        // "abcde" -> 0xF04FC729 is a commonly cited Fletcher-32 test vector.
        assert_eq!(fletcher32(b"abcde"), 0xF04FC729);
    }
}
