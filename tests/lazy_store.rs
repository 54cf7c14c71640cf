//! Integration tests for the record-paged lazy reference store: paging,
//! eager and explicit writes, flush semantics, tombstones, reopening.

use std::sync::Arc;

use bytes::Bytes;
use refvfs::store::block::{BlockCodec, ZstdBlockCodec};
use refvfs::{
    LazyRefMap, LocalBackend, OnError, RefSource, Reference, ReferenceFs,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn zarray_3x3() -> Reference {
    Reference::Inline(Bytes::from(
        serde_json::to_vec(&serde_json::json!({"shape": [3, 3], "chunks": [1, 1]})).unwrap(),
    ))
}

fn chunk_ref(flat: u64) -> Reference {
    Reference::Slice {
        url: Some("data.bin".to_string()),
        offset: flat * 10,
        size: 10,
    }
}

async fn fresh_store(record_size: usize) -> (TempDir, LazyRefMap) {
    let dir = TempDir::new().unwrap();
    let root = dir.path().display().to_string();
    let map = LazyRefMap::create(root, Arc::new(LocalBackend), record_size, 16)
        .await
        .unwrap();
    (dir, map)
}

async fn store_with_field(record_size: usize) -> (TempDir, LazyRefMap) {
    let (dir, mut map) = fresh_store(record_size).await;
    map.put("f/.zarray", zarray_3x3()).await.unwrap();
    (dir, map)
}

fn record_rows(dir: &TempDir, field: &str, record: u64) -> usize {
    let path = dir.path().join(field).join(format!("refs.{record}.parq"));
    let data = std::fs::read(path).unwrap();
    ZstdBlockCodec::default().decode(&data).unwrap().rows()
}

// ---------------------------------------------------------------------------
// Tests: paging layout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn complete_records_are_written_eagerly() {
    let (dir, mut map) = store_with_field(4).await;

    // 3x3 grid in row-major order: records fill at 4, 8, and 9 entries.
    for i in 0..3u64 {
        for j in 0..3u64 {
            map.put(&format!("f/{i}.{j}"), chunk_ref(i * 3 + j)).await.unwrap();
        }
    }

    assert_eq!(map.dirty_partitions(), 0);
    assert_eq!(record_rows(&dir, "f", 0), 4);
    assert_eq!(record_rows(&dir, "f", 1), 4);
    assert_eq!(record_rows(&dir, "f", 2), 1);

    // The ninth chunk lands in the final one-row record.
    assert_eq!(map.get("f/2.2").await.unwrap(), chunk_ref(8));
    assert_eq!(map.get("f/1.0").await.unwrap(), chunk_ref(3));
}

#[tokio::test]
async fn inline_and_whole_rows_round_trip() {
    let (_dir, mut map) = store_with_field(4).await;

    map.put("f/0.0", Reference::Inline(Bytes::from_static(b"ascii")))
        .await
        .unwrap();
    map.put("f/0.1", Reference::Inline(Bytes::from_static(&[0xff, 0x01])))
        .await
        .unwrap();
    map.put("f/0.2", Reference::Whole(Some("whole.bin".into())))
        .await
        .unwrap();
    map.put("f/1.0", chunk_ref(3)).await.unwrap();
    map.flush().await.unwrap();

    assert_eq!(
        map.get("f/0.0").await.unwrap(),
        Reference::Inline(Bytes::from_static(b"ascii"))
    );
    assert_eq!(
        map.get("f/0.1").await.unwrap(),
        Reference::Inline(Bytes::from_static(&[0xff, 0x01]))
    );
    assert_eq!(
        map.get("f/0.2").await.unwrap(),
        Reference::Whole(Some("whole.bin".into()))
    );
}

#[tokio::test]
async fn reads_page_through_the_cache_after_reopen() {
    let (dir, mut map) = store_with_field(4).await;
    for i in 0..3u64 {
        for j in 0..3u64 {
            map.put(&format!("f/{i}.{j}"), chunk_ref(i * 3 + j)).await.unwrap();
        }
    }
    map.flush().await.unwrap();
    drop(map);

    let root = dir.path().display().to_string();
    let reopened = LazyRefMap::open(root, Arc::new(LocalBackend), 16).await.unwrap();
    assert_eq!(reopened.record_size(), 4);
    for flat in 0..9u64 {
        let key = format!("f/{}.{}", flat / 3, flat % 3);
        assert_eq!(reopened.get(&key).await.unwrap(), chunk_ref(flat));
    }
}

// ---------------------------------------------------------------------------
// Tests: flush semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flush_writes_staged_partitions() {
    let (dir, mut map) = store_with_field(4).await;

    // Two of the four rows of record 0: not enough for an eager write.
    map.put("f/0.0", chunk_ref(0)).await.unwrap();
    map.put("f/0.1", chunk_ref(1)).await.unwrap();
    assert_eq!(map.dirty_partitions(), 1);
    assert!(!dir.path().join("f/refs.0.parq").exists());

    map.flush().await.unwrap();
    assert_eq!(map.dirty_partitions(), 0);
    assert_eq!(record_rows(&dir, "f", 0), 4);

    // Unassigned rows read back as absent.
    assert_eq!(map.get("f/0.0").await.unwrap(), chunk_ref(0));
    assert!(map.get("f/0.2").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn flush_is_idempotent() {
    let (dir, mut map) = store_with_field(4).await;
    map.put("f/0.0", chunk_ref(0)).await.unwrap();
    map.flush().await.unwrap();

    let record = std::fs::read(dir.path().join("f/refs.0.parq")).unwrap();
    let metadata = std::fs::read(dir.path().join(".zmetadata")).unwrap();

    // The second flush has no partitions left: it only rewrites
    // `.zmetadata`, unchanged.
    map.flush().await.unwrap();
    assert_eq!(std::fs::read(dir.path().join("f/refs.0.parq")).unwrap(), record);
    assert_eq!(std::fs::read(dir.path().join(".zmetadata")).unwrap(), metadata);
}

#[tokio::test]
async fn read_after_write_survives_reopen() {
    let (dir, mut map) = store_with_field(4).await;
    map.put("f/1.1", chunk_ref(4)).await.unwrap();
    map.flush().await.unwrap();
    drop(map);

    let reopened = LazyRefMap::open(dir.path().display().to_string(), Arc::new(LocalBackend), 16)
        .await
        .unwrap();
    assert_eq!(reopened.get("f/1.1").await.unwrap(), chunk_ref(4));
    assert_eq!(
        reopened.get("f/.zarray").await.unwrap(),
        zarray_3x3()
    );
}

// ---------------------------------------------------------------------------
// Tests: tombstones and iteration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleted_chunks_stay_deleted_across_flush() {
    let (dir, mut map) = store_with_field(4).await;
    map.put("f/0.0", chunk_ref(0)).await.unwrap();
    map.put("f/0.1", chunk_ref(1)).await.unwrap();
    map.put("f/0.2", chunk_ref(2)).await.unwrap();
    // The tombstone completes the partition and triggers the write.
    map.delete("f/1.0").await.unwrap();
    assert_eq!(map.dirty_partitions(), 0);

    assert!(map.get("f/1.0").await.unwrap_err().is_not_found());
    assert_eq!(map.get("f/0.1").await.unwrap(), chunk_ref(1));

    // Persist `.zmetadata` so a reopened map knows the field's grid.
    map.flush().await.unwrap();
    let reopened = LazyRefMap::open(dir.path().display().to_string(), Arc::new(LocalBackend), 16)
        .await
        .unwrap();
    assert!(reopened.get("f/1.0").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn iteration_counts_expected_chunks_not_present_ones() {
    let (_dir, mut map) = store_with_field(4).await;
    map.put("f/0.0", chunk_ref(0)).await.unwrap();

    // 9 expected chunks + the .zarray metadata entry, however few rows
    // were actually written.
    assert_eq!(map.len(), 10);
    let keys = map.keys();
    assert_eq!(keys.len(), 10);
    assert!(keys.contains(&"f/.zarray".to_string()));
    assert!(keys.contains(&"f/2.2".to_string()));

    // A listed key still fails on get when its row is absent.
    assert!(map.get("f/2.2").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn staged_values_win_over_disk_until_written() {
    let (_dir, mut map) = store_with_field(4).await;
    for (flat, key) in ["f/0.0", "f/0.1", "f/0.2", "f/1.0"].iter().enumerate() {
        map.put(key, chunk_ref(flat as u64)).await.unwrap();
    }
    // Record 0 is on disk now; restage one chunk with a new value.
    map.put("f/0.0", chunk_ref(99)).await.unwrap();
    assert_eq!(map.get("f/0.0").await.unwrap(), chunk_ref(99));
    // And a staged tombstone shadows the disk row.
    map.delete("f/0.1").await.unwrap();
    assert!(map.get("f/0.1").await.unwrap_err().is_not_found());
}

// ---------------------------------------------------------------------------
// Tests: listings and metadata
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ls_lists_fields_and_present_chunks() {
    let (_dir, mut map) = store_with_field(4).await;
    for i in 0..3u64 {
        for j in 0..3u64 {
            map.put(&format!("f/{i}.{j}"), chunk_ref(i * 3 + j)).await.unwrap();
        }
    }
    map.delete("f/2.2").await.unwrap();
    map.flush().await.unwrap();

    let root = map.ls("").await.unwrap();
    let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&".zmetadata"));
    assert!(names.contains(&"f"));

    let field = map.ls("f").await.unwrap();
    let names: Vec<&str> = field.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"f/.zarray"));
    assert!(names.contains(&"f/0.0"));
    // The tombstoned chunk is not listed as present.
    assert!(!names.contains(&"f/2.2"));
    // Declared sizes come straight from the rows.
    let entry = field.iter().find(|e| e.name == "f/0.0").unwrap();
    assert_eq!(entry.size, Some(10));

    assert!(map.ls("missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn metadata_keys_resolve_inline() {
    let (_dir, mut map) = fresh_store(8).await;
    map.put(
        ".zgroup",
        Reference::Inline(Bytes::from_static(b"{\"zarr_format\":2}")),
    )
    .await
    .unwrap();
    let got = map.get(".zgroup").await.unwrap();
    assert_eq!(
        got,
        Reference::Inline(Bytes::from_static(b"{\"zarr_format\":2}"))
    );
    assert!(map.get(".zmetadata").await.is_ok());
    map.delete(".zgroup").await.unwrap();
    assert!(map.get(".zgroup").await.unwrap_err().is_not_found());
}

// ---------------------------------------------------------------------------
// Tests: dispatcher over a lazy store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reference_fs_serves_a_record_paged_store() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().display().to_string();

    // Author a catalog pointing at a local data file.
    let data_path = dir.path().join("data.bin").display().to_string();
    let payload: Vec<u8> = (0..=89u8).collect();
    std::fs::write(&data_path, &payload).unwrap();

    let mut map = LazyRefMap::create(root.clone(), Arc::new(LocalBackend), 4, 16)
        .await
        .unwrap();
    map.put("f/.zarray", zarray_3x3()).await.unwrap();
    for i in 0..3u64 {
        for j in 0..3u64 {
            let flat = i * 3 + j;
            map.put(
                &format!("f/{i}.{j}"),
                Reference::Slice {
                    url: Some(data_path.clone()),
                    offset: flat * 10,
                    size: 10,
                },
            )
            .await
            .unwrap();
        }
    }
    map.flush().await.unwrap();
    drop(map);

    // Serve it.
    let fs = ReferenceFs::builder(RefSource::Dir(root)).build().await.unwrap();
    assert_eq!(
        fs.cat_file("f/2.2", None, None).await.unwrap(),
        Bytes::copy_from_slice(&payload[80..90])
    );
    let out = fs
        .cat(&["f/0.0", "f/0.1", "f/2.2"], OnError::Raise)
        .await
        .unwrap();
    assert_eq!(
        out["f/0.1"].as_ref().unwrap(),
        &Bytes::copy_from_slice(&payload[10..20])
    );
    assert!(fs.isdir("f").await);
    assert!(fs.isfile("f/1.1").await);
    assert_eq!(fs.find("f").len(), 10);
}
