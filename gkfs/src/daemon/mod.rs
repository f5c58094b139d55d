pub mod handler;
pub mod io_pool;
pub mod metadentry;
pub mod stats;

use crate::config::{FsSettings, Settings};
use crate::distributor::{Distributor, HostId, PlacementPolicy};
use crate::error::{FsError, FsResult};
use crate::metadata::{MetadataBackend, MetadataDb};
use crate::rpc::FsConfig;
use crate::storage::{ChunkStorage, ChunkStorageError};
use dashmap::DashMap;
use io_pool::IoPool;
use stats::DaemonStats;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a daemon's request handlers share.
pub struct DaemonContext {
    pub fs: FsSettings,
    pub mountdir: PathBuf,
    pub rootdir: PathBuf,
    pub storage: Arc<ChunkStorage>,
    pub metadata: MetadataDb,
    pub io_pool: IoPool,
    pub stats: DaemonStats,
    placement: PlacementPolicy,
    distributors: DashMap<(HostId, u64), Arc<dyn Distributor>>,
}

impl DaemonContext {
    pub fn new(
        settings: &Settings,
        backend: Arc<dyn MetadataBackend>,
    ) -> Result<Self, ChunkStorageError> {
        let storage = ChunkStorage::new(settings.daemon.chunk_dir(), settings.fs.chunk_size)?;
        info!(
            "Chunk storage at {} with chunk size {}, {} I/O slots",
            storage.root().display(),
            settings.fs.chunk_size,
            settings.daemon.io_threads
        );
        Ok(Self {
            fs: settings.fs.clone(),
            mountdir: settings.daemon.mountdir.clone(),
            rootdir: settings.daemon.rootdir.clone(),
            storage: Arc::new(storage),
            metadata: MetadataDb::new(backend),
            io_pool: IoPool::new(settings.daemon.io_threads),
            stats: DaemonStats::new(),
            placement: settings.placement.clone(),
            distributors: DashMap::new(),
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.storage.chunk_size()
    }

    /// Placement as seen by host `host_id` of a `host_size` cluster, which is
    /// what the sender of a data request assumed.
    pub fn distributor(&self, host_id: HostId, host_size: u64) -> FsResult<Arc<dyn Distributor>> {
        if let Some(distributor) = self.distributors.get(&(host_id, host_size)) {
            return Ok(Arc::clone(distributor.value()));
        }
        let distributor = self.placement.build(host_id, host_size).map_err(|e| {
            warn!(
                "Cannot place data for host {} of {}: {}",
                host_id, host_size, e
            );
            FsError::from(e)
        })?;
        self.distributors
            .insert((host_id, host_size), Arc::clone(&distributor));
        Ok(distributor)
    }

    pub fn fs_config(&self) -> FsConfig {
        FsConfig {
            mountdir: self.mountdir.display().to_string(),
            rootdir: self.rootdir.display().to_string(),
            chunk_size: self.chunk_size(),
            atime_state: true,
            mtime_state: true,
            ctime_state: true,
            link_count_state: true,
            blocks_state: true,
        }
    }
}
