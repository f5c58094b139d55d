pub mod backend;
pub mod db;

pub use backend::{MemoryBackend, MetadataBackend};
pub use db::{MetadataDb, MetadataError};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub fn current_time() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(e) => {
            warn!("System time is before UNIX epoch: {:?}", e);
            0
        }
    }
}

/// Per-path record kept by the path's metadata owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub mode: u32,
    pub size: u64,
    pub link_count: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Stored for completeness, never followed.
    pub target_path: Option<String>,
}

impl Metadata {
    pub fn new(mode: u32) -> Self {
        let now = current_time();
        Self {
            mode,
            size: 0,
            link_count: 1,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            target_path: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

/// Selective update of a record. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub blocks: Option<u64>,
    pub link_count: Option<u64>,
    pub size: Option<u64>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
    pub ctime: Option<u64>,
}

impl MetadataUpdate {
    pub fn apply(&self, md: &mut Metadata) {
        if let Some(blocks) = self.blocks {
            md.blocks = blocks;
        }
        if let Some(link_count) = self.link_count {
            md.link_count = link_count;
        }
        if let Some(size) = self.size {
            md.size = size;
        }
        if let Some(atime) = self.atime {
            md.atime = atime;
        }
        if let Some(mtime) = self.mtime {
            md.mtime = mtime;
        }
        if let Some(ctime) = self.ctime {
            md.ctime = ctime;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dirent {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirentExtended {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub ctime: u64,
}
