//! Placement of metadata and data chunks onto daemons.
//!
//! All distributors are pure functions of their inputs and the host count, so
//! any client can route a request without asking a directory service.

use crate::arithmetic::ChunkId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub type HostId = u64;

pub trait Distributor: Send + Sync {
    fn localhost(&self) -> HostId;

    fn hosts_size(&self) -> u64;

    fn locate_data(&self, path: &str, chunk_id: ChunkId) -> HostId;

    fn locate_file_metadata(&self, path: &str) -> HostId;

    /// Directory entries are spread over all hosts.
    fn locate_directory_metadata(&self, _path: &str) -> Vec<HostId> {
        (0..self.hosts_size()).collect()
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a. Must give identical results in every process of the cluster.
fn stable_hash(parts: &[&[u8]]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for part in parts {
        for byte in part.iter() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Murmur3 finalizer, spreads FNV's weak low bits before taking a modulus.
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

fn path_hash(path: &str) -> u64 {
    fmix64(stable_hash(&[path.as_bytes()]))
}

fn chunk_hash(path: &str, chunk_id: ChunkId) -> u64 {
    fmix64(stable_hash(&[path.as_bytes(), chunk_id.to_string().as_bytes()]))
}

#[derive(Debug, Clone)]
pub struct SimpleHashDistributor {
    localhost: HostId,
    hosts_size: u64,
}

impl SimpleHashDistributor {
    pub fn new(localhost: HostId, hosts_size: u64) -> Self {
        assert!(hosts_size > 0, "cluster must have at least one host");
        Self {
            localhost,
            hosts_size,
        }
    }
}

impl Distributor for SimpleHashDistributor {
    fn localhost(&self) -> HostId {
        self.localhost
    }

    fn hosts_size(&self) -> u64 {
        self.hosts_size
    }

    fn locate_data(&self, path: &str, chunk_id: ChunkId) -> HostId {
        chunk_hash(path, chunk_id) % self.hosts_size
    }

    fn locate_file_metadata(&self, path: &str) -> HostId {
        path_hash(path) % self.hosts_size
    }
}

#[derive(Debug, Clone)]
pub struct LocalOnlyDistributor {
    localhost: HostId,
}

impl LocalOnlyDistributor {
    pub fn new(localhost: HostId) -> Self {
        Self { localhost }
    }
}

impl Distributor for LocalOnlyDistributor {
    fn localhost(&self) -> HostId {
        self.localhost
    }

    fn hosts_size(&self) -> u64 {
        1
    }

    fn locate_data(&self, _path: &str, _chunk_id: ChunkId) -> HostId {
        self.localhost
    }

    fn locate_file_metadata(&self, _path: &str) -> HostId {
        self.localhost
    }

    fn locate_directory_metadata(&self, _path: &str) -> Vec<HostId> {
        vec![self.localhost]
    }
}

/// Sends all data to a single forwarding host while metadata stays hashed.
#[derive(Debug, Clone)]
pub struct ForwarderDistributor {
    forward_host: HostId,
    hosts_size: u64,
}

impl ForwarderDistributor {
    pub fn new(forward_host: HostId, hosts_size: u64) -> Self {
        assert!(hosts_size > 0, "cluster must have at least one host");
        assert!(forward_host < hosts_size, "forward host out of range");
        Self {
            forward_host,
            hosts_size,
        }
    }
}

impl Distributor for ForwarderDistributor {
    fn localhost(&self) -> HostId {
        self.forward_host
    }

    fn hosts_size(&self) -> u64 {
        self.hosts_size
    }

    fn locate_data(&self, _path: &str, _chunk_id: ChunkId) -> HostId {
        self.forward_host
    }

    fn locate_file_metadata(&self, path: &str) -> HostId {
        path_hash(path) % self.hosts_size
    }
}

/// Consistent hashing variant using Lamping and Veach's jump hash.
#[derive(Debug, Clone)]
pub struct JumpHashDistributor {
    localhost: HostId,
    hosts_size: u64,
}

impl JumpHashDistributor {
    pub fn new(localhost: HostId, hosts_size: u64) -> Self {
        assert!(hosts_size > 0, "cluster must have at least one host");
        assert!(hosts_size <= i32::MAX as u64, "too many hosts for jump hash");
        Self {
            localhost,
            hosts_size,
        }
    }
}

fn jump_consistent_hash(mut key: u64, num_buckets: i32) -> i32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < num_buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        let denom = ((key >> 33) + 1) as f64;
        j = ((b as f64 + 1.0) * ((1u64 << 31) as f64) / denom).floor() as i64;
    }
    b as i32
}

impl Distributor for JumpHashDistributor {
    fn localhost(&self) -> HostId {
        self.localhost
    }

    fn hosts_size(&self) -> u64 {
        self.hosts_size
    }

    fn locate_data(&self, path: &str, chunk_id: ChunkId) -> HostId {
        jump_consistent_hash(chunk_hash(path, chunk_id), self.hosts_size as i32) as HostId
    }

    fn locate_file_metadata(&self, path: &str) -> HostId {
        jump_consistent_hash(path_hash(path), self.hosts_size as i32) as HostId
    }
}

/// Placement driven by a mapping file, falling back to [`SimpleHashDistributor`].
///
/// Each line of the file is either `<path> <chunk_id> <host>`, pinning one
/// chunk, or `#<prefix>`, which places data of every path under the prefix on
/// that path's metadata host.
#[derive(Debug, Clone)]
pub struct GuidedDistributor {
    fallback: SimpleHashDistributor,
    pinned: HashMap<String, BTreeMap<ChunkId, HostId>>,
    colocated_prefixes: Vec<String>,
}

impl GuidedDistributor {
    pub fn new(localhost: HostId, hosts_size: u64) -> Self {
        Self {
            fallback: SimpleHashDistributor::new(localhost, hosts_size),
            pinned: HashMap::new(),
            colocated_prefixes: Vec::new(),
        }
    }

    /// Loads the mapping. A missing file yields plain hash placement.
    pub fn from_file(
        localhost: HostId,
        hosts_size: u64,
        map_file: &Path,
    ) -> Result<Self, std::io::Error> {
        let mut distributor = Self::new(localhost, hosts_size);
        let content = match std::fs::read_to_string(map_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Guided distribution map {:?} not found, using hash placement",
                    map_file
                );
                return Ok(distributor);
            }
            Err(e) => return Err(e),
        };
        distributor.parse_map(&content)?;
        debug!(
            "Loaded guided distribution: {} pinned paths, {} colocated prefixes",
            distributor.pinned.len(),
            distributor.colocated_prefixes.len()
        );
        Ok(distributor)
    }

    fn parse_map(&mut self, content: &str) -> Result<(), std::io::Error> {
        let invalid = |line_no: usize, msg: &str| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("guided map line {}: {}", line_no + 1, msg),
            )
        };

        for (line_no, line) in content.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let Some(path) = fields.next() else {
                continue;
            };
            if let Some(prefix) = path.strip_prefix('#') {
                self.colocated_prefixes.push(prefix.to_string());
                continue;
            }
            let chunk_id: ChunkId = fields
                .next()
                .ok_or_else(|| invalid(line_no, "missing chunk id"))?
                .parse()
                .map_err(|_| invalid(line_no, "bad chunk id"))?;
            let host: HostId = fields
                .next()
                .ok_or_else(|| invalid(line_no, "missing host"))?
                .parse()
                .map_err(|_| invalid(line_no, "bad host"))?;
            if host >= self.fallback.hosts_size() {
                return Err(invalid(line_no, "host out of range"));
            }
            // first mapping for a chunk wins
            self.pinned
                .entry(path.to_string())
                .or_default()
                .entry(chunk_id)
                .or_insert(host);
        }
        Ok(())
    }
}

impl Distributor for GuidedDistributor {
    fn localhost(&self) -> HostId {
        self.fallback.localhost()
    }

    fn hosts_size(&self) -> u64 {
        self.fallback.hosts_size()
    }

    fn locate_data(&self, path: &str, chunk_id: ChunkId) -> HostId {
        if let Some(host) = self
            .pinned
            .get(path)
            .and_then(|chunks| chunks.get(&chunk_id))
        {
            return *host;
        }
        if self
            .colocated_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return self.fallback.locate_file_metadata(path);
        }
        self.fallback.locate_data(path, chunk_id)
    }

    fn locate_file_metadata(&self, path: &str) -> HostId {
        self.fallback.locate_file_metadata(path)
    }
}

/// Placement policy selected in the configuration. Every process of a
/// cluster must use the same one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacementPolicy {
    #[default]
    SimpleHash,
    JumpHash,
    LocalOnly,
    Forwarder {
        forward_host: HostId,
    },
    Guided {
        map_file: PathBuf,
    },
}

impl PlacementPolicy {
    pub fn build(
        &self,
        localhost: HostId,
        hosts_size: u64,
    ) -> Result<Arc<dyn Distributor>, std::io::Error> {
        let invalid = |msg: String| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg);
        if hosts_size == 0 {
            return Err(invalid("cluster must have at least one host".to_string()));
        }
        if localhost >= hosts_size {
            return Err(invalid(format!(
                "host id {} out of range for {} hosts",
                localhost, hosts_size
            )));
        }
        Ok(match self {
            PlacementPolicy::SimpleHash => {
                Arc::new(SimpleHashDistributor::new(localhost, hosts_size))
            }
            PlacementPolicy::JumpHash => {
                if hosts_size > i32::MAX as u64 {
                    return Err(invalid(format!(
                        "jump hash supports at most {} hosts, got {}",
                        i32::MAX,
                        hosts_size
                    )));
                }
                Arc::new(JumpHashDistributor::new(localhost, hosts_size))
            }
            PlacementPolicy::LocalOnly => Arc::new(LocalOnlyDistributor::new(localhost)),
            PlacementPolicy::Forwarder { forward_host } => {
                if *forward_host >= hosts_size {
                    return Err(invalid(format!(
                        "forward host {} out of range for {} hosts",
                        forward_host, hosts_size
                    )));
                }
                Arc::new(ForwarderDistributor::new(*forward_host, hosts_size))
            }
            PlacementPolicy::Guided { map_file } => Arc::new(GuidedDistributor::from_file(
                localhost, hosts_size, map_file,
            )?),
        })
    }
}
