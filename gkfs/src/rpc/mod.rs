pub mod client;
pub mod server;

use crate::arithmetic::ChunkId;
use crate::distributor::HostId;
use crate::error::FsError;
use crate::metadata::{Dirent, DirentExtended, Metadata, MetadataUpdate};
use crate::planner::SegmentRequest;
use crate::storage::ChunkStat;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Chunk range of one data request as seen by a single daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIoRequest {
    pub path: String,
    /// Offset inside the first chunk of the whole request.
    pub offset: u64,
    /// Id of the receiving daemon.
    pub host_id: HostId,
    pub host_size: u64,
    /// Chunks in `[chunk_start, chunk_end]` owned by the receiver.
    pub chunk_count: u64,
    pub chunk_start: ChunkId,
    pub chunk_end: ChunkId,
    /// Bytes the receiver transfers.
    pub total_chunk_size: u64,
}

impl ChunkIoRequest {
    pub fn segment_request(&self, chunk_size: u64) -> SegmentRequest {
        SegmentRequest {
            offset: self.offset,
            chunk_start: self.chunk_start,
            chunk_end: self.chunk_end,
            chunk_count: self.chunk_count,
            total_chunk_size: self.total_chunk_size,
            chunk_size,
        }
    }
}

/// `io_size` is meaningful even when `err` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoResponse {
    pub err: Option<FsError>,
    pub io_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub err: Option<FsError>,
    pub io_size: u64,
    /// The receiver's segments back to back, `total_chunk_size` bytes.
    pub bulk: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedEntry {
    pub mode: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsConfig {
    pub mountdir: String,
    pub rootdir: String,
    pub chunk_size: u64,
    pub atime_state: bool,
    pub mtime_state: bool,
    pub ctime_state: bool,
    pub link_count_state: bool,
    pub blocks_state: bool,
}

#[tarpc::service]
pub trait GkfsRpc {
    async fn create(path: String, mode: u32) -> Result<(), FsError>;

    async fn stat(path: String) -> Result<Metadata, FsError>;

    async fn remove_metadata(path: String) -> Result<RemovedEntry, FsError>;

    async fn remove_data(path: String) -> Result<(), FsError>;

    async fn update_metadentry(path: String, update: MetadataUpdate) -> Result<(), FsError>;

    async fn update_metadentry_size(
        path: String,
        size: u64,
        offset: u64,
        append: bool,
    ) -> Result<u64, FsError>;

    async fn get_metadentry_size(path: String) -> Result<u64, FsError>;

    async fn decr_size(path: String, length: u64) -> Result<(), FsError>;

    async fn get_dirents(path: String, buffer_size: u64) -> Result<Vec<Dirent>, FsError>;

    async fn get_dirents_extended(
        path: String,
        buffer_size: u64,
    ) -> Result<Vec<DirentExtended>, FsError>;

    async fn write(request: ChunkIoRequest, bulk: Bytes) -> IoResponse;

    async fn read(request: ChunkIoRequest) -> ReadResponse;

    async fn truncate(path: String, length: u64) -> Result<(), FsError>;

    async fn chunk_stat() -> Result<ChunkStat, FsError>;

    async fn fs_config() -> FsConfig;

    async fn stats() -> String;
}
