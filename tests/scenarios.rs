//! End-to-end scenarios against file-backed stores.

use chunkstore::{Store, StoreConfig};

fn config_at(path: &std::path::Path) -> StoreConfig {
    StoreConfig::default().file_name(path).auto_commit_delay_ms(0)
}

#[test]
fn s1_open_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.db");
    let store = Store::open(config_at(&path)).unwrap();
    assert_eq!(store.current_version(), 0);
    assert!(store.map_names().unwrap().is_empty());
    store.close().unwrap();
}

#[test]
fn s2_insert_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.db");
    {
        let store = Store::open(config_at(&path)).unwrap();
        let m = store.open_map("m").unwrap();
        m.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        m.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        let v = store.commit().unwrap();
        assert_eq!(v, 1);
        store.close().unwrap();
    }
    {
        let store = Store::open(config_at(&path)).unwrap();
        let m = store.open_map("m").unwrap();
        assert_eq!(m.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(m.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.last_stored_version().unwrap(), 1);
        store.close().unwrap();
    }
}

#[test]
fn s3_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3.db");
    let store = Store::open(config_at(&path)).unwrap();
    let m = store.open_map("m").unwrap();
    m.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    store.commit().unwrap();

    m.put(b"a".to_vec(), b"9".to_vec()).unwrap();
    store.commit().unwrap();

    store.rollback_to(1).unwrap();
    let m = store.open_map("m").unwrap();
    assert_eq!(m.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn s4_crash_tail_recovers_previous_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s4.db");
    {
        let store = Store::open(config_at(&path)).unwrap();
        let m = store.open_map("m").unwrap();
        m.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.commit().unwrap();
        m.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 512).unwrap();
    drop(file);

    let store = Store::open(config_at(&path)).unwrap();
    let m = store.open_map("m").unwrap();
    assert_eq!(m.get(b"a").unwrap(), Some(b"1".to_vec()));

    m.put(b"c".to_vec(), b"3".to_vec()).unwrap();
    assert!(store.commit().is_ok());
}

#[test]
fn s5_compaction_reclaims_space() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s5.db");
    let store = Store::open(config_at(&path)).unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let m = store.open_map(&format!("map{i}")).unwrap();
        for j in 0..50u32 {
            m.put(format!("k{j}").into_bytes(), vec![b'x'; 64]).unwrap();
        }
        handles.push((i, m));
    }
    store.commit().unwrap();

    for (i, _) in handles.iter().take(16) {
        store.remove_map(&format!("map{i}")).unwrap();
    }
    store.commit().unwrap();

    store.compact(50, 1_000_000).unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();

    store.compact_move_chunks(100, u64::MAX).unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after <= size_before);

    for (i, _) in handles.iter().skip(16) {
        let m = store.open_map(&format!("map{i}")).unwrap();
        assert_eq!(m.get(b"k0").unwrap(), Some(vec![b'x'; 64]));
    }
}

#[test]
fn s6_reader_pins_old_version_until_deregistered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s6.db");
    let store = Store::open(config_at(&path)).unwrap();
    let m = store.open_map("m").unwrap();
    m.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    store.commit().unwrap(); // v1

    let pin = store.register_version_usage();
    let pinned_version = pin.version();

    m.put(b"a".to_vec(), b"2".to_vec()).unwrap();
    store.commit().unwrap(); // v2
    m.put(b"a".to_vec(), b"3".to_vec()).unwrap();
    store.commit().unwrap(); // v3

    let oldest_while_pinned = store.oldest_version_to_keep();
    assert!(oldest_while_pinned <= pinned_version);

    store.deregister_version_usage(pin);
    assert!(store.oldest_version_to_keep() > oldest_while_pinned);
}
