use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Deserialization error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Disk capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),
    #[error("System time error: {0}")]
    SystemTime(String),
}

#[derive(Debug, Clone)]
pub struct DiskStoreConfig {
    pub path: PathBuf,
    /// Maximum number of pending records.
    pub max_records: usize,
    /// Maximum bytes the store may occupy on disk.
    pub max_bytes: u64,
    pub compression: bool,
    pub retention_period: Duration,
}

impl Default for DiskStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/rask-ingest-buffer/spill"),
            max_records: 1_000_000,
            max_bytes: 1024 * 1024 * 1024, // 1GB
            compression: true,
            retention_period: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredRecord<T> {
    seq: u64,
    stored_at: u64, // Unix timestamp
    item: T,
}

/// Durable overflow queue: one record file per spilled item, keyed by a
/// monotonically increasing write sequence. Records found on startup are
/// treated as backlog; the owning `BufferManager` drains them before
/// accepting new spill traffic preferentially ("recovering" mode).
///
/// Records that cannot be read back, whether undecodable or missing,
/// are skipped and counted, never propagated: losing one spilled event
/// is preferable to wedging the drain path.
pub struct DiskStore<T> {
    config: DiskStoreConfig,
    /// Pending record sequence -> on-disk file size.
    pending: BTreeMap<u64, u64>,
    next_seq: u64,
    current_bytes: u64,
    corrupt_records: u64,
    _item: PhantomData<T>,
}

impl<T> DiskStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Opens the store, creating the directory if needed and scanning
    /// any records persisted by a prior run.
    pub async fn open(config: DiskStoreConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.path).await.map_err(|e| {
            StorageError::InvalidStoragePath(format!("{}: {e}", config.path.display()))
        })?;

        let mut pending = BTreeMap::new();
        let mut current_bytes = 0u64;
        let mut entries = fs::read_dir(&config.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(seq) = Self::parse_seq(&entry.path()) else {
                continue;
            };
            let size = entry.metadata().await?.len();
            current_bytes += size;
            pending.insert(seq, size);
        }

        let next_seq = pending.keys().next_back().map_or(0, |last| last + 1);
        if !pending.is_empty() {
            tracing::info!(
                backlog = pending.len(),
                bytes = current_bytes,
                "disk store opened with persisted backlog"
            );
        }

        Ok(Self {
            config,
            pending,
            next_seq,
            current_bytes,
            corrupt_records: 0,
            _item: PhantomData,
        })
    }

    /// Persists one item. Fails with `CapacityExceeded` when either the
    /// record or byte bound would be crossed; the caller falls back to
    /// the memory tier.
    pub async fn write(&mut self, item: &T) -> Result<(), StorageError> {
        if self.pending.len() >= self.config.max_records {
            return Err(StorageError::CapacityExceeded(format!(
                "{} records pending",
                self.pending.len()
            )));
        }

        let seq = self.next_seq;
        let stored_at = unix_now()?;
        let record = StoredRecord {
            seq,
            stored_at,
            item,
        };

        let serialized = bincode::serde::encode_to_vec(&record, bincode::config::standard())?;
        let data = if self.config.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(&serialized)?;
            encoder.finish()?
        } else {
            serialized
        };

        if self.current_bytes + data.len() as u64 > self.config.max_bytes {
            return Err(StorageError::CapacityExceeded(format!(
                "{} bytes on disk",
                self.current_bytes
            )));
        }

        let file_path = self.record_path(seq);
        let mut file = fs::File::create(&file_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        self.next_seq += 1;
        self.current_bytes += data.len() as u64;
        self.pending.insert(seq, data.len() as u64);

        tracing::trace!(seq, bytes = data.len(), "spilled record to disk");
        Ok(())
    }

    /// Dequeues up to `max_count` items in write order. Returns fewer
    /// when the backlog is exhausted; never blocks waiting for more.
    ///
    /// A record that fails to load is skipped and counted so that one
    /// bad file can never abort the batch or stall every later read.
    /// A record is deleted only after it has been collected.
    pub async fn read(&mut self, max_count: usize) -> Vec<T> {
        let mut items = Vec::with_capacity(max_count.min(self.pending.len()));

        while items.len() < max_count {
            let Some((&seq, &size)) = self.pending.iter().next() else {
                break;
            };
            let file_path = self.record_path(seq);

            match self.load_record(&file_path).await {
                Ok(record) => items.push(record.item),
                Err(err) => {
                    self.corrupt_records += 1;
                    tracing::warn!(seq, error = %err, "skipping unreadable spill record");
                }
            }

            if let Err(err) = fs::remove_file(&file_path).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                // The item is already in the batch; a leftover file is
                // redelivered after a restart instead of lost here.
                tracing::warn!(seq, error = %err, "failed to remove drained spill record");
            }
            self.pending.remove(&seq);
            self.current_bytes = self.current_bytes.saturating_sub(size);
        }

        items
    }

    /// Removes records older than the configured retention period,
    /// returning the count removed.
    pub async fn sweep_expired(&mut self) -> Result<u32, StorageError> {
        let now = unix_now()?;
        let retention_secs = self.config.retention_period.as_secs();
        let seqs: Vec<u64> = self.pending.keys().copied().collect();
        let mut removed = 0u32;

        for seq in seqs {
            let file_path = self.record_path(seq);
            let expired = match self.load_record(&file_path).await {
                Ok(record) => now.saturating_sub(record.stored_at) > retention_secs,
                // Sweep is also the opportunity to shed corrupt records.
                Err(StorageError::Io(_)) => continue,
                Err(_) => {
                    self.corrupt_records += 1;
                    true
                }
            };
            if expired {
                let size = self.pending.get(&seq).copied().unwrap_or(0);
                fs::remove_file(&file_path).await?;
                self.pending.remove(&seq);
                self.current_bytes = self.current_bytes.saturating_sub(size);
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "swept expired spill records");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub fn usage_percent(&self) -> f64 {
        (self.current_bytes as f64 / self.config.max_bytes as f64) * 100.0
    }

    pub fn corrupt_records(&self) -> u64 {
        self.corrupt_records
    }

    pub fn close(&mut self) {
        tracing::debug!(
            pending = self.pending.len(),
            bytes = self.current_bytes,
            "disk store closed"
        );
    }

    fn record_path(&self, seq: u64) -> PathBuf {
        self.config.path.join(format!("{seq:020}.rec"))
    }

    fn parse_seq(path: &Path) -> Option<u64> {
        if path.extension()?.to_str()? != "rec" {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    async fn load_record(&self, path: &Path) -> Result<StoredRecord<T>, StorageError> {
        let mut file = fs::File::open(path).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        // Decompress if possible, otherwise assume an uncompressed record
        // (tolerates a compression setting change across restarts).
        let raw = match decompress(&data) {
            Ok(decompressed) => decompressed,
            Err(_) => data,
        };

        let (record, _): (StoredRecord<T>, usize) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())?;
        Ok(record)
    }
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

fn unix_now() -> Result<u64, StorageError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| StorageError::SystemTime(format!("invalid system time: {e}")))
}
