//! The metadata map: a persistent ordered map with string keys and values,
//! storing every other map's configuration, root pointers, chunk
//! descriptors, and user settings (§3).

use crate::chunk::Chunk;
use crate::mvmap::MvMap;
use crate::page::PagePosition;

pub const META_MAP_ID: u32 = 0;
pub const META_MAP_NAME: &str = "meta";

/// Thin typed view over the raw string->string [`MvMap`] that backs it.
pub struct MetaMap {
    pub(crate) map: MvMap,
}

impl MetaMap {
    pub fn new() -> Self {
        Self {
            map: MvMap::new(META_MAP_ID, META_MAP_NAME),
        }
    }

    pub fn from_map(map: MvMap) -> Self {
        Self { map }
    }

    pub fn root(&self) -> PagePosition {
        self.map.root()
    }

    pub fn is_dirty(&self) -> bool {
        self.map.is_dirty()
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.map.get(key.as_bytes()).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    fn put_str(&mut self, key: &str, value: String) {
        self.map.put(key.as_bytes().to_vec(), value.into_bytes());
    }

    fn remove_key(&mut self, key: &str) {
        self.map.remove(key.as_bytes());
    }

    pub fn put_chunk(&mut self, chunk: &Chunk) {
        self.put_str(&format!("chunk.{:x}", chunk.id), chunk.encode_meta_value());
    }

    pub fn remove_chunk(&mut self, id: u32) {
        self.remove_key(&format!("chunk.{id:x}"));
    }

    pub fn get_chunk_value(&self, id: u32) -> Option<String> {
        self.get_str(&format!("chunk.{id:x}"))
    }

    /// Enumerate every `chunk.*` entry as `(id, raw value)` pairs.
    pub fn all_chunk_entries(&self) -> Vec<(u32, String)> {
        self.map
            .iter()
            .filter_map(|(k, v)| {
                let k = std::str::from_utf8(k).ok()?;
                let id_hex = k.strip_prefix("chunk.")?;
                let id = u32::from_str_radix(id_hex, 16).ok()?;
                Some((id, String::from_utf8_lossy(v).into_owned()))
            })
            .collect()
    }

    pub fn put_map_config(&mut self, id: u32, config: &str) {
        self.put_str(&format!("map.{id:x}"), config.to_string());
    }

    pub fn remove_map_config(&mut self, id: u32) {
        self.remove_key(&format!("map.{id:x}"));
    }

    pub fn has_map_config(&self, id: u32) -> bool {
        self.get_str(&format!("map.{id:x}")).is_some()
    }

    pub fn put_name(&mut self, name: &str, id: u32) {
        self.put_str(&format!("name.{name}"), format!("{id:x}"));
    }

    pub fn remove_name(&mut self, name: &str) {
        self.remove_key(&format!("name.{name}"));
    }

    pub fn get_id_by_name(&self, name: &str) -> Option<u32> {
        self.get_str(&format!("name.{name}"))
            .and_then(|hex| u32::from_str_radix(&hex, 16).ok())
    }

    pub fn all_map_names(&self) -> Vec<String> {
        self.map
            .iter()
            .filter_map(|(k, _)| {
                std::str::from_utf8(k)
                    .ok()
                    .and_then(|k| k.strip_prefix("name."))
                    .map(|s| s.to_string())
            })
            .collect()
    }

    pub fn put_root(&mut self, map_id: u32, pos: PagePosition) {
        self.put_str(&format!("root.{map_id:x}"), format!("{:x}", pos.raw()));
    }

    pub fn remove_root(&mut self, map_id: u32) {
        self.remove_key(&format!("root.{map_id:x}"));
    }

    pub fn get_root(&self, map_id: u32) -> Option<PagePosition> {
        self.get_str(&format!("root.{map_id:x}"))
            .and_then(|hex| u64::from_str_radix(&hex, 16).ok())
            .map(PagePosition::from_raw)
    }

    pub fn put_setting(&mut self, key: &str, value: &str) {
        self.put_str(&format!("setting.{key}"), value.to_string());
    }

    pub fn get_setting(&self, key: &str) -> Option<String> {
        self.get_str(&format!("setting.{key}"))
    }
}

impl Default for MetaMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    #[test]
    fn chunk_entries_round_trip_through_meta() {
        let mut meta = MetaMap::new();
        let mut c = Chunk::new(4, 1, 10);
        c.block = 4096;
        meta.put_chunk(&c);
        let entries = meta.all_chunk_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, 4);
        let decoded = Chunk::decode_meta_value(&entries[0].1).unwrap();
        assert_eq!(decoded.block, 4096);
    }

    #[test]
    fn name_and_root_lookups_work() {
        let mut meta = MetaMap::new();
        meta.put_name("widgets", 3);
        meta.put_root(3, PagePosition::new(1, 0, 0, crate::page::PageKind::Leaf));
        assert_eq!(meta.get_id_by_name("widgets"), Some(3));
        assert!(meta.get_root(3).unwrap().is_saved());
    }
}
