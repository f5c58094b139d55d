use super::backend::MetadataBackend;
use super::{Dirent, DirentExtended, Metadata, MetadataUpdate};
use crate::error::FsError;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

const PATH_LOCK_SHARDS: usize = 256;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("no metadata for '{0}'")]
    NotFound(String),

    #[error("metadata for '{0}' already exists")]
    Exists(String),

    #[error("failed to encode or decode metadata record for '{path}': {source}")]
    Codec {
        path: String,
        #[source]
        source: bincode::Error,
    },

    #[error("cannot decrease size of '{path}' from {current} to {requested}")]
    InvalidSize {
        path: String,
        current: u64,
        requested: u64,
    },
}

impl From<MetadataError> for FsError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::NotFound(_) => FsError::NotFound,
            MetadataError::Exists(_) => FsError::Exists,
            MetadataError::InvalidSize { .. } => FsError::InvalidArgument,
            MetadataError::Codec { .. } => FsError::IoError,
        }
    }
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Metadata operations of one daemon on top of a key-value backend.
///
/// Mutations of a path run under one of a fixed set of async mutexes chosen
/// by the path, so size updates to the same path are applied one at a time in
/// arrival order.
pub struct MetadataDb {
    backend: Arc<dyn MetadataBackend>,
    path_locks: Vec<Mutex<()>>,
}

impl MetadataDb {
    pub fn new(backend: Arc<dyn MetadataBackend>) -> Self {
        let path_locks = (0..PATH_LOCK_SHARDS).map(|_| Mutex::new(())).collect();
        Self {
            backend,
            path_locks,
        }
    }

    async fn lock_path(&self, path: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        let shard = hasher.finish() as usize % PATH_LOCK_SHARDS;
        self.path_locks[shard].lock().await
    }

    fn encode(path: &str, md: &Metadata) -> Result<Bytes> {
        bincode::serialize(md)
            .map(Bytes::from)
            .map_err(|source| MetadataError::Codec {
                path: path.to_string(),
                source,
            })
    }

    fn decode(path: &str, value: &[u8]) -> Result<Metadata> {
        bincode::deserialize(value).map_err(|source| MetadataError::Codec {
            path: path.to_string(),
            source,
        })
    }

    async fn load(&self, path: &str) -> Result<Metadata> {
        match self.backend.get(path).await {
            Some(value) => Self::decode(path, &value),
            None => Err(MetadataError::NotFound(path.to_string())),
        }
    }

    pub async fn create(&self, path: &str, md: Metadata, exist_check: bool) -> Result<()> {
        let _guard = self.lock_path(path).await;
        let value = Self::encode(path, &md)?;
        if exist_check {
            if !self.backend.put_no_exist(path, value).await {
                return Err(MetadataError::Exists(path.to_string()));
            }
        } else {
            self.backend.put(path, value).await;
        }
        debug!("Created metadata for '{}' with mode {:o}", path, md.mode);
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Metadata> {
        self.load(path).await
    }

    pub async fn get_size(&self, path: &str) -> Result<u64> {
        Ok(self.load(path).await?.size)
    }

    /// Removes the record and returns what it held.
    pub async fn remove(&self, path: &str) -> Result<Metadata> {
        let _guard = self.lock_path(path).await;
        match self.backend.remove(path).await {
            Some(value) => Self::decode(path, &value),
            None => Err(MetadataError::NotFound(path.to_string())),
        }
    }

    pub async fn update(&self, path: &str, update: &MetadataUpdate) -> Result<()> {
        let _guard = self.lock_path(path).await;
        let mut md = self.load(path).await?;
        update.apply(&mut md);
        self.backend.put(path, Self::encode(path, &md)?).await;
        Ok(())
    }

    /// Grows the size after a write of `io_size` bytes at `offset`.
    ///
    /// Appends ignore `offset` and extend the current size. Returns the size
    /// after the update for appends, and `offset + io_size` otherwise.
    pub async fn update_size(
        &self,
        path: &str,
        io_size: u64,
        offset: u64,
        append: bool,
    ) -> Result<u64> {
        let _guard = self.lock_path(path).await;
        let mut md = self.load(path).await?;
        let ret = if append {
            md.size = md.size.saturating_add(io_size);
            md.size
        } else {
            let end = offset.saturating_add(io_size);
            md.size = md.size.max(end);
            end
        };
        self.backend.put(path, Self::encode(path, &md)?).await;
        trace!(
            "Updated size of '{}' to {} (io_size {}, offset {}, append {})",
            path, md.size, io_size, offset, append
        );
        Ok(ret)
    }

    /// Sets the size to `size`, which must not exceed the current size.
    pub async fn decrease_size(&self, path: &str, size: u64) -> Result<()> {
        let _guard = self.lock_path(path).await;
        let mut md = self.load(path).await?;
        if size > md.size {
            return Err(MetadataError::InvalidSize {
                path: path.to_string(),
                current: md.size,
                requested: size,
            });
        }
        md.size = size;
        self.backend.put(path, Self::encode(path, &md)?).await;
        Ok(())
    }

    async fn children(&self, dir: &str) -> Result<Vec<(String, Metadata)>> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{}/", dir)
        };
        let mut children = Vec::new();
        for (key, value) in self.backend.scan_prefix(&prefix).await {
            let name = &key[prefix.len()..];
            // skip deeper levels
            if name.is_empty() || name.contains('/') {
                continue;
            }
            children.push((name.to_string(), Self::decode(&key, &value)?));
        }
        Ok(children)
    }

    /// Direct children of `dir` that are stored on this daemon.
    pub async fn get_dirents(&self, dir: &str) -> Result<Vec<Dirent>> {
        Ok(self
            .children(dir)
            .await?
            .into_iter()
            .map(|(name, md)| Dirent {
                name,
                is_dir: md.is_dir(),
            })
            .collect())
    }

    pub async fn get_dirents_extended(&self, dir: &str) -> Result<Vec<DirentExtended>> {
        Ok(self
            .children(dir)
            .await?
            .into_iter()
            .map(|(name, md)| DirentExtended {
                name,
                is_dir: md.is_dir(),
                size: md.size,
                ctime: md.ctime,
            })
            .collect())
    }
}
