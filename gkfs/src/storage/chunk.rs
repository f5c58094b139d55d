use crate::arithmetic::ChunkId;
use crate::error::FsError;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, trace};

const CHUNK_FILE_MODE: u32 = 0o640;

#[derive(Error, Debug)]
pub enum ChunkStorageError {
    #[error("failed to {op} chunk {chunk_id} of '{path}': {source}")]
    Chunk {
        op: &'static str,
        path: String,
        chunk_id: ChunkId,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to {op} chunk space of '{path}': {source}")]
    Space {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("range [{offset}, {offset}+{len}) exceeds chunk size {chunk_size}")]
    OutOfBounds {
        offset: u64,
        len: u64,
        chunk_size: u64,
    },

    #[error("failed to stat chunk storage: {0}")]
    Stat(#[source] std::io::Error),
}

impl ChunkStorageError {
    pub fn errno(&self) -> i32 {
        match self {
            ChunkStorageError::Chunk { source, .. }
            | ChunkStorageError::Space { source, .. }
            | ChunkStorageError::Stat(source) => source.raw_os_error().unwrap_or(libc::EIO),
            ChunkStorageError::OutOfBounds { .. } => libc::EINVAL,
        }
    }
}

impl From<ChunkStorageError> for FsError {
    fn from(e: ChunkStorageError) -> Self {
        FsError::from_errno(e.errno())
    }
}

pub type Result<T> = std::result::Result<T, ChunkStorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkStat {
    pub chunk_size: u64,
    pub chunk_total: u64,
    pub chunk_free: u64,
}

/// Stores each chunk of a file as its own file below `root`.
///
/// Chunks of `/a/b/c` live in `<root>/a:b:c/<chunk_id>`, so a chunk can be
/// found from its path and id alone.
#[derive(Debug, Clone)]
pub struct ChunkStorage {
    root: PathBuf,
    chunk_size: u64,
}

impl ChunkStorage {
    pub fn new(root: impl Into<PathBuf>, chunk_size: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| ChunkStorageError::Space {
            op: "create",
            path: root.display().to_string(),
            source,
        })?;
        debug!("Chunk storage initialized at {:?}", root);
        Ok(Self { root, chunk_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_dir_name(path: &str) -> String {
        path.strip_prefix('/').unwrap_or(path).replace('/', ":")
    }

    fn chunk_dir(&self, path: &str) -> PathBuf {
        self.root.join(Self::chunk_dir_name(path))
    }

    fn chunk_path(&self, path: &str, chunk_id: ChunkId) -> PathBuf {
        self.chunk_dir(path).join(chunk_id.to_string())
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let len = len as u64;
        if offset.checked_add(len).is_none_or(|end| end > self.chunk_size) {
            return Err(ChunkStorageError::OutOfBounds {
                offset,
                len,
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }

    /// Writes `buf` at `offset` inside the chunk, creating it on first use.
    pub fn write_chunk(
        &self,
        path: &str,
        chunk_id: ChunkId,
        buf: &[u8],
        offset: u64,
    ) -> Result<usize> {
        self.check_bounds(offset, buf.len())?;
        let chunk_err = |op, source| ChunkStorageError::Chunk {
            op,
            path: path.to_string(),
            chunk_id,
            source,
        };

        fs::create_dir_all(self.chunk_dir(path)).map_err(|e| chunk_err("create dir for", e))?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(CHUNK_FILE_MODE)
            .open(self.chunk_path(path, chunk_id))
            .map_err(|e| chunk_err("open", e))?;

        file.write_all_at(buf, offset)
            .map_err(|e| chunk_err("write", e))?;

        trace!(
            "Wrote {} bytes to chunk {} of '{}' at offset {}",
            buf.len(),
            chunk_id,
            path,
            offset
        );
        Ok(buf.len())
    }

    /// Reads into `buf` from `offset` inside the chunk.
    ///
    /// Returns fewer bytes than requested when the chunk is shorter, and 0 for
    /// a chunk that was never written. Bytes of `buf` past the returned count
    /// are left untouched.
    pub fn read_chunk(
        &self,
        path: &str,
        chunk_id: ChunkId,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        self.check_bounds(offset, buf.len())?;
        let chunk_err = |op, source| ChunkStorageError::Chunk {
            op,
            path: path.to_string(),
            chunk_id,
            source,
        };

        let file = match OpenOptions::new()
            .read(true)
            .open(self.chunk_path(path, chunk_id))
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(chunk_err("open", e)),
        };

        let mut total = 0usize;
        while total < buf.len() {
            match file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(chunk_err("read", e)),
            }
        }

        trace!(
            "Read {} of {} bytes from chunk {} of '{}' at offset {}",
            total,
            buf.len(),
            chunk_id,
            path,
            offset
        );
        Ok(total)
    }

    /// Shrinks one chunk to `length` bytes. A chunk that was never written is
    /// left alone.
    pub fn truncate_chunk_file(&self, path: &str, chunk_id: ChunkId, length: u64) -> Result<()> {
        self.check_bounds(0, length as usize)?;
        let file = match OpenOptions::new()
            .write(true)
            .open(self.chunk_path(path, chunk_id))
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(ChunkStorageError::Chunk {
                    op: "open",
                    path: path.to_string(),
                    chunk_id,
                    source,
                });
            }
        };
        file.set_len(length)
            .map_err(|source| ChunkStorageError::Chunk {
                op: "truncate",
                path: path.to_string(),
                chunk_id,
                source,
            })
    }

    /// Removes every chunk with an id `>= chunk_start`.
    pub fn trim_chunk_space(&self, path: &str, chunk_start: ChunkId) -> Result<()> {
        let entries = match fs::read_dir(self.chunk_dir(path)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(ChunkStorageError::Space {
                    op: "list",
                    path: path.to_string(),
                    source,
                });
            }
        };

        let mut last_err = None;
        for entry in entries.flatten() {
            let Some(chunk_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ChunkId>().ok())
            else {
                continue;
            };
            if chunk_id < chunk_start {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    error!("Failed to remove chunk {} of '{}': {}", chunk_id, path, e);
                    last_err = Some(ChunkStorageError::Chunk {
                        op: "remove",
                        path: path.to_string(),
                        chunk_id,
                        source: e,
                    });
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn destroy_chunk_space(&self, path: &str) -> Result<()> {
        match fs::remove_dir_all(self.chunk_dir(path)) {
            Ok(()) => {
                debug!("Destroyed chunk space of '{}'", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ChunkStorageError::Space {
                op: "destroy",
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Capacity of the underlying file system in units of chunks.
    pub fn chunk_stat(&self) -> Result<ChunkStat> {
        let c_path = CString::new(self.root.as_os_str().as_bytes()).map_err(|e| {
            ChunkStorageError::Stat(std::io::Error::new(ErrorKind::InvalidInput, e))
        })?;
        // SAFETY: statvfs is plain old data, zero is a valid bit pattern
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is NUL terminated and stat points to writable memory
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if ret != 0 {
            return Err(ChunkStorageError::Stat(std::io::Error::last_os_error()));
        }

        let fragment = stat.f_frsize as u64;
        let bytes_total = stat.f_blocks as u64 * fragment;
        let bytes_free = stat.f_bavail as u64 * fragment;
        Ok(ChunkStat {
            chunk_size: self.chunk_size,
            chunk_total: bytes_total / self.chunk_size,
            chunk_free: bytes_free / self.chunk_size,
        })
    }

    #[cfg(test)]
    pub(crate) fn chunk_len(&self, path: &str, chunk_id: ChunkId) -> Option<u64> {
        fs::metadata(self.chunk_path(path, chunk_id))
            .ok()
            .map(|m| m.len())
    }
}
