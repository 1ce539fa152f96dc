//! Page framing: every page written into a chunk's buffer is prefixed with
//! its own length and trailed with an xxh3_64 checksum, so the commit
//! pipeline, recovery, and GC can all fetch it back out (and notice torn or
//! bit-rotted pages) given only a [`PagePosition`] and the chunk it names.

use byteorder::{ByteOrder, LE};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::StoreError;
use crate::file_store::FileStore;

const FRAME_PREFIX_LEN: usize = 4;
const FRAME_CHECKSUM_LEN: usize = 8;

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len() + FRAME_CHECKSUM_LEN);
    let mut len_bytes = [0u8; FRAME_PREFIX_LEN];
    LE::write_u32(&mut len_bytes, payload.len() as u32);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(payload);
    let checksum = xxh3_64(&out);
    let mut checksum_bytes = [0u8; FRAME_CHECKSUM_LEN];
    LE::write_u64(&mut checksum_bytes, checksum);
    out.extend_from_slice(&checksum_bytes);
    out
}

pub fn frame_len(payload_len: usize) -> usize {
    FRAME_PREFIX_LEN + payload_len + FRAME_CHECKSUM_LEN
}

/// Read the page frame whose length prefix starts at `abs_offset`, verifying
/// its trailing checksum before handing the payload back.
pub fn read_frame(file_store: &FileStore, abs_offset: u64) -> Result<Vec<u8>, StoreError> {
    let prefix = file_store.read(abs_offset, FRAME_PREFIX_LEN)?;
    let len = LE::read_u32(&prefix) as usize;
    let body = file_store.read(abs_offset, FRAME_PREFIX_LEN + len)?;
    let checksum_bytes = file_store.read(abs_offset + (FRAME_PREFIX_LEN + len) as u64, FRAME_CHECKSUM_LEN)?;
    let expected = LE::read_u64(&checksum_bytes);
    if xxh3_64(&body) != expected {
        return Err(StoreError::corrupt("page frame checksum mismatch"));
    }
    Ok(body[FRAME_PREFIX_LEN..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_file_store() {
        let mut fs = FileStore::anonymous(4096 * 4).unwrap();
        let off = fs.append(4096).unwrap();
        let frame = encode_frame(b"hello world");
        assert_eq!(frame.len(), frame_len(b"hello world".len()));
        fs.write(off, &frame).unwrap();
        let back = read_frame(&fs, off).unwrap();
        assert_eq!(back, b"hello world");
    }

    #[test]
    fn frame_rejects_corrupted_checksum() {
        let mut fs = FileStore::anonymous(4096 * 4).unwrap();
        let off = fs.append(4096).unwrap();
        let mut frame = encode_frame(b"hello world");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        fs.write(off, &frame).unwrap();
        assert!(read_frame(&fs, off).is_err());
    }
}
