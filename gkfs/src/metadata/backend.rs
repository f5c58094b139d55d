use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

/// Key-value persistence for serialized metadata records.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<Bytes>;

    async fn put(&self, key: &str, value: Bytes);

    /// Inserts only if the key is absent. Returns false if it already exists.
    async fn put_no_exist(&self, key: &str, value: Bytes) -> bool;

    async fn remove(&self, key: &str) -> Option<Bytes>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, Bytes)>;

    async fn entry_count(&self) -> usize;
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot written by [`MemoryBackend::snapshot`]. A missing file
    /// yields an empty backend.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let entries: BTreeMap<String, Bytes> = bincode::deserialize(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        info!("Loaded {} metadata entries from {}", entries.len(), path.display());
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Writes all entries to `path`, replacing it atomically.
    pub async fn snapshot(&self, path: &Path) -> io::Result<()> {
        let data = {
            let entries = self.entries.read().await;
            bincode::serialize(&*entries).map_err(io::Error::other)?
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!("Wrote metadata snapshot of {} bytes to {}", data.len(), path.display());
        Ok(())
    }
}

#[async_trait]
impl MetadataBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, value: Bytes) {
        self.entries.write().await.insert(key.to_string(), value);
    }

    async fn put_no_exist(&self, key: &str, value: Bytes) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), value);
        true
    }

    async fn remove(&self, key: &str) -> Option<Bytes> {
        self.entries.write().await.remove(key)
    }

    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, Bytes)> {
        let entries = self.entries.read().await;
        entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}
