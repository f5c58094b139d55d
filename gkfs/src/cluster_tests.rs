//! End-to-end tests of client and daemons talking over in-memory tarpc
//! channels.

use crate::client::Client;
use crate::config::Settings;
use crate::daemon::DaemonContext;
use crate::daemon::test_support::settings;
use crate::distributor::{Distributor, HostId, PlacementPolicy};
use crate::error::FsError;
use crate::metadata::MemoryBackend;
use crate::rpc::client::test_support::ChannelConnector;
use crate::rpc::server::GkfsRpcImpl;
use crate::storage::ChunkStorage;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CHUNK_SIZE: u64 = 65536;
const FILE: u32 = libc::S_IFREG | 0o644;
const DIR: u32 = libc::S_IFDIR | 0o755;

struct Cluster {
    _dir: TempDir,
    daemons: Vec<Arc<DaemonContext>>,
    distributor: Arc<dyn Distributor>,
    client: Client,
}

impl Cluster {
    fn new(nodes: u64) -> Self {
        Self::with(nodes, &[], |_| {})
    }

    /// Hosts listed in `silent` accept requests and never answer.
    fn with(nodes: u64, silent: &[HostId], tweak: impl Fn(&mut Settings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut client_settings = settings(dir.path(), CHUNK_SIZE);
        tweak(&mut client_settings);

        let daemons: Vec<Arc<DaemonContext>> = (0..nodes)
            .map(|i| {
                let mut node_settings = settings(&dir.path().join(format!("node{i}")), CHUNK_SIZE);
                tweak(&mut node_settings);
                Arc::new(
                    DaemonContext::new(&node_settings, Arc::new(MemoryBackend::new())).unwrap(),
                )
            })
            .collect();
        let servers = daemons
            .iter()
            .enumerate()
            .map(|(i, ctx)| {
                (!silent.contains(&(i as HostId))).then(|| GkfsRpcImpl::new(Arc::clone(ctx)))
            })
            .collect();

        let distributor = PlacementPolicy::SimpleHash.build(0, nodes).unwrap();
        let client = Client::new(
            Arc::clone(&distributor),
            Arc::new(ChannelConnector::new(servers)),
            &client_settings,
        );
        Self {
            _dir: dir,
            daemons,
            distributor,
            client,
        }
    }

    fn owner(&self, path: &str, chunk_id: u64) -> &DaemonContext {
        &self.daemons[self.distributor.locate_data(path, chunk_id) as usize]
    }

    fn write_requests(&self) -> Vec<u64> {
        self.daemons
            .iter()
            .map(|d| d.stats.write_requests.load(Ordering::Relaxed))
            .collect()
    }

    /// A path whose first `chunks` chunks all live on different hosts, with
    /// its metadata off `avoid_md`.
    fn spread_path(&self, chunks: u64, avoid_md: Option<HostId>) -> String {
        (0..)
            .map(|i| format!("/data/file{i}"))
            .find(|path| {
                let owners: HashSet<HostId> = (0..chunks)
                    .map(|c| self.distributor.locate_data(path, c))
                    .collect();
                owners.len() as u64 == chunks
                    && avoid_md.is_none_or(|h| self.distributor.locate_file_metadata(path) != h)
            })
            .unwrap()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect()
}

#[tokio::test]
async fn test_single_node_roundtrip() {
    let cluster = Cluster::new(1);
    let data = pattern(100, 7);

    cluster.client.create("/file", FILE).await.unwrap();
    let outcome = cluster.client.write("/file", &data, 0, false).await;
    assert_eq!(outcome.into_result(), Ok(100));

    let mut buf = vec![0u8; 100];
    let outcome = cluster.client.read("/file", &mut buf, 0).await;
    assert_eq!(outcome.into_result(), Ok(100));
    assert_eq!(buf, data);

    let md = cluster.client.stat("/file").await.unwrap();
    assert_eq!(md.size, 100);
    assert!(md.is_regular());
}

#[tokio::test]
async fn test_three_nodes_one_request_per_owner() {
    let cluster = Cluster::new(3);
    let path = cluster.spread_path(3, None);
    let data = pattern(150_000, 1);

    cluster.client.create(&path, FILE).await.unwrap();
    let outcome = cluster.client.write(&path, &data, 0, false).await;
    assert_eq!(outcome.err, None);
    assert_eq!(outcome.io_size, 150_000);
    assert_eq!(cluster.write_requests(), vec![1, 1, 1]);

    assert_eq!(cluster.owner(&path, 0).storage.chunk_len(&path, 0), Some(CHUNK_SIZE));
    assert_eq!(cluster.owner(&path, 1).storage.chunk_len(&path, 1), Some(CHUNK_SIZE));
    assert_eq!(
        cluster.owner(&path, 2).storage.chunk_len(&path, 2),
        Some(150_000 - 2 * CHUNK_SIZE)
    );

    let mut buf = vec![0u8; 150_000];
    let outcome = cluster.client.read(&path, &mut buf, 0).await;
    assert_eq!(outcome.into_result(), Ok(150_000));
    assert_eq!(buf, data);

    // an unaligned read in the middle
    let mut buf = vec![0u8; 70_000];
    let outcome = cluster.client.read(&path, &mut buf, 60_000).await;
    assert_eq!(outcome.into_result(), Ok(70_000));
    assert_eq!(&buf[..], &data[60_000..130_000]);
}

#[tokio::test]
async fn test_shared_owner_gets_single_request() {
    let cluster = Cluster::new(2);
    // eight chunks over two hosts
    let path = "/data/wide";
    let data = pattern(8 * CHUNK_SIZE as usize, 3);

    cluster.client.create(path, FILE).await.unwrap();
    let outcome = cluster.client.write(path, &data, 0, false).await;
    assert_eq!(outcome.into_result(), Ok(8 * CHUNK_SIZE));

    let owners: HashSet<HostId> = (0..8)
        .map(|c| cluster.distributor.locate_data(path, c))
        .collect();
    let requests: u64 = cluster.write_requests().iter().sum();
    assert_eq!(requests, owners.len() as u64);
}

#[tokio::test]
async fn test_truncate_drops_tail_chunks() {
    let cluster = Cluster::new(3);
    let path = cluster.spread_path(3, None);
    let data = pattern(200_000, 5);

    cluster.client.create(&path, FILE).await.unwrap();
    let outcome = cluster.client.write(&path, &data, 0, false).await;
    assert_eq!(outcome.into_result(), Ok(200_000));
    assert_eq!(
        cluster.owner(&path, 3).storage.chunk_len(&path, 3),
        Some(200_000 - 3 * CHUNK_SIZE)
    );

    cluster.client.truncate(&path, 70_000).await.unwrap();
    assert_eq!(cluster.client.get_size(&path).await, Ok(70_000));
    assert_eq!(cluster.owner(&path, 0).storage.chunk_len(&path, 0), Some(CHUNK_SIZE));
    assert_eq!(cluster.owner(&path, 1).storage.chunk_len(&path, 1), Some(4464));
    assert_eq!(cluster.owner(&path, 2).storage.chunk_len(&path, 2), None);
    assert_eq!(cluster.owner(&path, 3).storage.chunk_len(&path, 3), None);

    let mut buf = vec![0u8; 70_000];
    let outcome = cluster.client.read(&path, &mut buf, 0).await;
    assert_eq!(outcome.into_result(), Ok(70_000));
    assert_eq!(&buf[..], &data[..70_000]);

    // same size is a no-op, growing is rejected
    cluster.client.truncate(&path, 70_000).await.unwrap();
    assert_eq!(
        cluster.client.truncate(&path, 80_000).await,
        Err(FsError::InvalidArgument)
    );
}

#[tokio::test]
async fn test_storage_failure_reports_partial_size() {
    let cluster = Cluster::new(3);
    let path = cluster.spread_path(3, None);
    let failing = cluster.owner(&path, 1);
    std::fs::write(
        failing.storage.root().join(ChunkStorage::chunk_dir_name(&path)),
        b"",
    )
    .unwrap();

    cluster.client.create(&path, FILE).await.unwrap();
    let started = Instant::now();
    let outcome = cluster.client.write(&path, &pattern(150_000, 9), 0, false).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let err = outcome.err.unwrap();
    assert_ne!(err.to_errno(), 0);
    assert_eq!(outcome.io_size, 150_000 - CHUNK_SIZE);
    assert_eq!(failing.storage.chunk_len(&path, 1), None);
    assert_eq!(failing.stats.chunk_errors.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_unresponsive_node_does_not_hang() {
    let layout = Cluster::new(3);
    let path = layout.spread_path(3, Some(2));
    drop(layout);

    let cluster = Cluster::with(3, &[2], |settings| {
        settings.rpc.timeout_ms = 200;
        settings.rpc.retries = 1;
    });
    cluster.client.create(&path, FILE).await.unwrap();

    let silent_chunk = (0..3)
        .find(|c| cluster.distributor.locate_data(&path, *c) == 2)
        .unwrap();
    let silent_len = if silent_chunk == 2 {
        150_000 - 2 * CHUNK_SIZE
    } else {
        CHUNK_SIZE
    };

    let started = Instant::now();
    let outcome = cluster.client.write(&path, &pattern(150_000, 2), 0, false).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.err, Some(FsError::Busy));
    assert_eq!(outcome.io_size, 150_000 - silent_len);
}

#[tokio::test]
async fn test_concurrent_appends_are_disjoint() {
    let cluster = Cluster::new(3);
    cluster.client.create("/log", FILE).await.unwrap();

    let a = vec![b'a'; 100_000];
    let b = vec![b'b'; 100_000];
    let (first, second) = tokio::join!(
        cluster.client.write("/log", &a, 0, true),
        cluster.client.write("/log", &b, 0, true)
    );
    assert_eq!(first.into_result(), Ok(100_000));
    assert_eq!(second.into_result(), Ok(100_000));

    let mut offsets = [first.offset, second.offset];
    offsets.sort_unstable();
    assert_eq!(offsets, [0, 100_000]);
    assert_eq!(cluster.client.get_size("/log").await, Ok(200_000));

    let mut buf = vec![0u8; 200_000];
    let outcome = cluster.client.read("/log", &mut buf, 0).await;
    assert_eq!(outcome.into_result(), Ok(200_000));
    let (a_at, b_at) = (first.offset as usize, second.offset as usize);
    assert!(buf[a_at..a_at + 100_000].iter().all(|c| *c == b'a'));
    assert!(buf[b_at..b_at + 100_000].iter().all(|c| *c == b'b'));
}

#[tokio::test]
async fn test_remove_drops_chunks_everywhere() {
    let cluster = Cluster::new(3);
    let path = cluster.spread_path(3, None);

    cluster.client.create(&path, FILE).await.unwrap();
    let outcome = cluster.client.write(&path, &pattern(150_000, 4), 0, false).await;
    assert_eq!(outcome.into_result(), Ok(150_000));

    let removed = cluster.client.remove(&path).await.unwrap();
    assert_eq!(removed.size, 150_000);
    for chunk_id in 0..3 {
        assert_eq!(cluster.owner(&path, chunk_id).storage.chunk_len(&path, chunk_id), None);
    }
    assert_eq!(cluster.client.stat(&path).await, Err(FsError::NotFound));
}

#[tokio::test]
async fn test_directory_listing_merges_hosts() {
    let cluster = Cluster::new(3);
    cluster.client.create("/d", DIR).await.unwrap();
    for name in ["alpha", "beta", "gamma", "delta"] {
        cluster
            .client
            .create(&format!("/d/{name}"), FILE)
            .await
            .unwrap();
    }
    cluster.client.create("/d/sub", DIR).await.unwrap();

    let names: Vec<String> = cluster
        .client
        .get_dirents("/d")
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec!["alpha", "beta", "delta", "gamma", "sub"]);

    let extended = cluster.client.get_dirents_extended("/d").await.unwrap();
    assert!(extended.iter().find(|e| e.name == "sub").unwrap().is_dir);

    assert_eq!(cluster.client.remove("/d").await, Err(FsError::NotEmpty));
    cluster.client.remove("/d/sub").await.unwrap();
    assert_eq!(cluster.client.get_dirents("/d").await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_listing_too_large_for_buffer() {
    let cluster = Cluster::with(1, &[], |settings| settings.fs.dirents_buff_size = 32);
    cluster.client.create("/d", DIR).await.unwrap();
    for i in 0..10 {
        cluster
            .client
            .create(&format!("/d/entry{i}"), FILE)
            .await
            .unwrap();
    }
    assert_eq!(
        cluster.client.get_dirents("/d").await,
        Err(FsError::NoBufferSpace)
    );
}

#[tokio::test]
async fn test_chunk_stat_and_config() {
    let cluster = Cluster::new(3);
    cluster.client.verify_cluster().await.unwrap();

    let single = cluster.client.fs_config(1).await.unwrap();
    assert_eq!(single.chunk_size, CHUNK_SIZE);

    let stat = cluster.client.chunk_stat().await.unwrap();
    assert_eq!(stat.chunk_size, CHUNK_SIZE);
    assert!(stat.chunk_total >= stat.chunk_free);
    assert!(stat.chunk_total > 0);

    let report = cluster.client.daemon_stats(0).await.unwrap();
    assert!(report.contains("gkfs Daemon Statistics"));
}

#[tokio::test]
async fn test_write_without_metadata_fails_cleanly() {
    let cluster = Cluster::new(2);
    let outcome = cluster.client.write("/ghost", b"data", 0, false).await;
    assert_eq!(outcome.err, Some(FsError::NotFound));
    assert_eq!(outcome.io_size, 0);
    assert_eq!(cluster.write_requests(), vec![0, 0]);
}
