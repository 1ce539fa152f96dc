//! `MVMap`: the persistent, copy-on-write ordered map collaborator.
//!
//! The real page/B-tree data structure is explicitly out of scope for the
//! store coordinator (see the design's §1 collaborator list): we only need
//! something that behaves like one — copy-on-write snapshots, a
//! `write_version` call that serializes whatever changed since the last save
//! into the write buffer and hands back a root [`PagePosition`], and the
//! ability to enumerate whether a map has unsaved changes at all. Internally
//! this is modeled as a single persistent page per map version rather than a
//! multi-level B+tree; see `DESIGN.md` for why that's a faithful
//! implementation of the narrow contract rather than a shortcut.

use std::collections::BTreeMap;
use std::sync::Arc;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::error::StoreError;
use crate::page::PagePosition;

/// One persistent ordered map, sharing no mutable state with other maps.
///
/// Mutations always clone-on-write the current snapshot (an `Arc`, so readers
/// who took a snapshot before the mutation keep seeing the old data).
#[derive(Clone)]
pub struct MvMap {
    pub(crate) id: u32,
    pub(crate) name: String,
    data: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Root position as of the last successful `write_version`, or
    /// `PagePosition::UNSAVED` if this map has never been stored (or its
    /// current in-memory state has not yet been serialized).
    root: PagePosition,
    dirty: bool,
}

impl MvMap {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            data: Arc::new(BTreeMap::new()),
            root: PagePosition::UNSAVED,
            dirty: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> PagePosition {
        self.root
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.data.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Insert or overwrite a value, marking the map dirty (its root becomes
    /// unsaved until the next `write_version`).
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        Arc::make_mut(&mut self.data).insert(key, value);
        self.dirty = true;
    }

    /// Remove a key, returning the old value if present. Only marks the map
    /// dirty if something was actually removed, so a no-op `remove` doesn't
    /// force a spurious rewrite.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let removed = Arc::make_mut(&mut self.data).remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Snapshot the current in-memory state into bytes suitable for writing
    /// into a chunk's write buffer. Does not clear the dirty flag: that is
    /// the caller's (the commit pipeline's) responsibility once the bytes
    /// have actually been placed at a final position.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.data.len() * 16);
        buf.write_u32::<LE>(self.data.len() as u32).unwrap();
        for (k, v) in self.data.iter() {
            buf.write_u32::<LE>(k.len() as u32).unwrap();
            buf.extend_from_slice(k);
            buf.write_u32::<LE>(v.len() as u32).unwrap();
            buf.extend_from_slice(v);
        }
        buf
    }

    /// Force the dirty bit without touching any entries, so compaction can
    /// make an otherwise-unchanged map get rewritten into a fresher chunk.
    pub fn touch_dirty(&mut self) {
        self.dirty = true;
    }

    /// Record that the current snapshot was written out at `pos`.
    pub fn mark_saved(&mut self, pos: PagePosition) {
        self.root = pos;
        self.dirty = false;
    }

    /// Rebuild a map's in-memory data from a serialized page, e.g. when
    /// opening an existing store or rolling a map back to an earlier root.
    pub fn load(id: u32, name: impl Into<String>, root: PagePosition, bytes: &[u8]) -> Result<Self, StoreError> {
        let data = deserialize(bytes)?;
        Ok(Self {
            id,
            name: name.into(),
            data: Arc::new(data),
            root,
            dirty: false,
        })
    }

    /// Reset to the empty map, as happens when `rollback_to(0)` drops everything.
    pub fn clear(&mut self) {
        self.data = Arc::new(BTreeMap::new());
        self.root = PagePosition::UNSAVED;
        self.dirty = false;
    }
}

pub(crate) fn deserialize_entries(bytes: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
    deserialize(bytes)
}

fn deserialize(bytes: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let count = cursor
        .read_u32::<LE>()
        .map_err(|_| StoreError::corrupt("truncated map page: missing entry count"))?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let klen = cursor
            .read_u32::<LE>()
            .map_err(|_| StoreError::corrupt("truncated map page: missing key length"))? as usize;
        let mut key = vec![0u8; klen];
        std::io::Read::read_exact(&mut cursor, &mut key)
            .map_err(|_| StoreError::corrupt("truncated map page: short key"))?;
        let vlen = cursor
            .read_u32::<LE>()
            .map_err(|_| StoreError::corrupt("truncated map page: missing value length"))? as usize;
        let mut value = vec![0u8; vlen];
        std::io::Read::read_exact(&mut cursor, &mut value)
            .map_err(|_| StoreError::corrupt("truncated map page: short value"))?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize() {
        let mut m = MvMap::new(1, "m");
        m.put(b"a".to_vec(), b"1".to_vec());
        m.put(b"b".to_vec(), b"2".to_vec());
        let bytes = m.serialize();
        let reloaded = MvMap::load(1, "m", PagePosition::UNSAVED, &bytes).unwrap();
        assert_eq!(reloaded.get(b"a"), Some(b"1".as_slice()));
        assert_eq!(reloaded.get(b"b"), Some(b"2".as_slice()));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn remove_of_missing_key_does_not_dirty() {
        let mut m = MvMap::new(1, "m");
        m.mark_saved(PagePosition::new(1, 0, 0, crate::page::PageKind::Leaf));
        assert!(m.remove(b"missing").is_none());
        assert!(!m.is_dirty());
    }

    #[test]
    fn clone_on_write_isolates_snapshots() {
        let mut m = MvMap::new(1, "m");
        m.put(b"a".to_vec(), b"1".to_vec());
        let snapshot = m.clone();
        m.put(b"a".to_vec(), b"2".to_vec());
        assert_eq!(snapshot.get(b"a"), Some(b"1".as_slice()));
        assert_eq!(m.get(b"a"), Some(b"2".as_slice()));
    }
}
