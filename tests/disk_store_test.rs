use bytes::Bytes;
use rask_ingest_buffer::domain::Event;
use rask_ingest_buffer::reliability::{DiskStore, DiskStoreConfig, StorageError};
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> DiskStoreConfig {
    DiskStoreConfig {
        path: dir.path().to_path_buf(),
        max_records: 10_000,
        max_bytes: 100 * 1024 * 1024,
        compression: true,
        retention_period: Duration::from_secs(3600),
    }
}

fn event(n: usize) -> Event {
    Event::new("syslog-udp", Bytes::from(format!("<34>message {n}")))
}

#[tokio::test]
async fn test_write_then_read_preserves_order() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = DiskStore::open(test_config(&temp_dir)).await.unwrap();

    let events: Vec<Event> = (0..5).map(event).collect();
    for e in &events {
        store.write(e).await.unwrap();
    }
    assert_eq!(store.len(), 5);

    let read = store.read(5).await;
    assert_eq!(read, events);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_read_returns_fewer_when_exhausted() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = DiskStore::open(test_config(&temp_dir)).await.unwrap();

    store.write(&event(1)).await.unwrap();
    store.write(&event(2)).await.unwrap();

    let read: Vec<Event> = store.read(100).await;
    assert_eq!(read.len(), 2);
    let empty: Vec<Event> = store.read(10).await;
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_backlog_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();

    {
        let mut store = DiskStore::open(test_config(&temp_dir)).await.unwrap();
        for n in 0..3 {
            store.write(&event(n)).await.unwrap();
        }
        store.close();
    }

    let mut reopened: DiskStore<Event> = DiskStore::open(test_config(&temp_dir)).await.unwrap();
    assert_eq!(reopened.len(), 3);

    // New writes sequence after the recovered backlog.
    reopened.write(&event(99)).await.unwrap();
    let read = reopened.read(10).await;
    assert_eq!(read.len(), 4);
    assert_eq!(read[3].payload, Bytes::from("<34>message 99"));
}

#[tokio::test]
async fn test_corrupt_record_is_skipped_and_counted() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = DiskStore::open(test_config(&temp_dir)).await.unwrap();

    store.write(&event(1)).await.unwrap();
    store.write(&event(2)).await.unwrap();

    // Clobber the first record on disk.
    let mut paths: Vec<_> = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    std::fs::write(&paths[0], b"not a record").unwrap();

    let read: Vec<Event> = store.read(10).await;
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].payload, Bytes::from("<34>message 2"));
    assert_eq!(store.corrupt_records(), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_missing_record_file_does_not_lose_the_rest() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = DiskStore::open(test_config(&temp_dir)).await.unwrap();

    for n in 0..3 {
        store.write(&event(n)).await.unwrap();
    }

    // Delete the middle record's file out from under the store.
    let mut paths: Vec<_> = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    std::fs::remove_file(&paths[1]).unwrap();

    // Both surviving records come back in one pass; the missing one is
    // counted, and later reads see a clean, empty store.
    let read: Vec<Event> = store.read(10).await;
    assert_eq!(read.len(), 2);
    assert_eq!(read[0].payload, Bytes::from("<34>message 0"));
    assert_eq!(read[1].payload, Bytes::from("<34>message 2"));
    assert_eq!(store.corrupt_records(), 1);
    assert!(store.is_empty());

    let empty: Vec<Event> = store.read(10).await;
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_record_capacity_is_enforced() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir);
    config.max_records = 2;
    let mut store = DiskStore::open(config).await.unwrap();

    store.write(&event(1)).await.unwrap();
    store.write(&event(2)).await.unwrap();
    let result = store.write(&event(3)).await;
    assert!(matches!(result, Err(StorageError::CapacityExceeded(_))));
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_byte_capacity_is_enforced() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir);
    config.max_bytes = 64;
    config.compression = false;
    let mut store = DiskStore::open(config).await.unwrap();

    let big = Event::new("file", Bytes::from(vec![b'x'; 4096]));
    let result = store.write(&big).await;
    assert!(matches!(result, Err(StorageError::CapacityExceeded(_))));
}

#[tokio::test]
async fn test_uncompressed_records_readable_after_enabling_compression() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir);
    config.compression = false;

    {
        let mut store = DiskStore::open(config.clone()).await.unwrap();
        store.write(&event(7)).await.unwrap();
    }

    config.compression = true;
    let mut store: DiskStore<Event> = DiskStore::open(config).await.unwrap();
    let read = store.read(1).await;
    assert_eq!(read[0].payload, Bytes::from("<34>message 7"));
}

#[tokio::test]
async fn test_sweep_removes_expired_records() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir);
    config.retention_period = Duration::from_secs(0);
    let mut store = DiskStore::open(config).await.unwrap();

    store.write(&event(1)).await.unwrap();
    store.write(&event(2)).await.unwrap();

    // Records must be strictly older than the retention period.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let removed = store.sweep_expired().await.unwrap();
    assert_eq!(removed, 2);
    assert!(store.is_empty());
    assert_eq!(store.current_bytes(), 0);
}
