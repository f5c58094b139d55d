//! Chunk data requests: write, read, truncate and storage statistics.

use super::DaemonContext;
use super::io_pool::join_all;
use super::stats::DaemonStats;
use crate::arithmetic::{ChunkId, block_index, block_overrun};
use crate::error::{FsError, FsResult};
use crate::planner::{self, ChunkSegment};
use crate::rpc::{ChunkIoRequest, IoResponse, ReadResponse};
use crate::storage::{ChunkStat, ChunkStorageError};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

/// Outcome of one chunk task.
#[derive(Debug)]
pub struct ChunkOpResult {
    pub chunk_id: ChunkId,
    pub result: Result<usize, ChunkStorageError>,
}

/// Accounting for one data request.
///
/// Keeps the in-flight gauge raised while alive. A guard dropped without
/// [`ResponseGuard::finish`] counts its request as failed.
pub struct ResponseGuard<'a> {
    stats: &'a DaemonStats,
    op: &'static str,
    path: String,
    started: Instant,
    finished: bool,
}

impl<'a> ResponseGuard<'a> {
    pub fn new(stats: &'a DaemonStats, op: &'static str, path: &str) -> Self {
        stats.in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            stats,
            op,
            path: path.to_string(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn finish(mut self, err: Option<FsError>, io_size: u64) -> IoResponse {
        self.finished = true;
        if err.is_some() {
            self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            "{} of '{}' finished in {:?}: io_size {}, err {:?}",
            self.op,
            self.path,
            self.started.elapsed(),
            io_size,
            err
        );
        IoResponse { err, io_size }
    }
}

impl Drop for ResponseGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
        if !self.finished {
            self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} of '{}' abandoned after {:?}",
                self.op,
                self.path,
                self.started.elapsed()
            );
        }
    }
}

fn plan_segments(
    ctx: &DaemonContext,
    op: &str,
    request: &ChunkIoRequest,
) -> FsResult<Vec<ChunkSegment>> {
    let distributor = ctx.distributor(request.host_id, request.host_size)?;
    planner::segments_for_target(
        &*distributor,
        &request.path,
        request.host_id,
        request.segment_request(ctx.chunk_size()),
    )
    .map_err(|e| {
        error!("Rejecting {} of '{}': {}", op, request.path, e);
        FsError::from(e)
    })
}

/// Splits the received transfer buffer into one slice per segment.
fn split_bulk(segments: &[ChunkSegment], bulk: &Bytes) -> FsResult<Vec<Bytes>> {
    let origin_extent = segments
        .last()
        .map(|s| s.origin_offset + s.len)
        .unwrap_or(0);
    let region = planner::to_bulk_region(origin_extent, segments)?;
    Ok(region.split(bulk)?)
}

/// Sums the bytes of all successful chunks and keeps the first error.
fn collect_results(
    ctx: &DaemonContext,
    op: &str,
    path: &str,
    results: impl IntoIterator<Item = Result<ChunkOpResult, JoinError>>,
) -> (u64, Option<FsError>) {
    let mut io_size = 0u64;
    let mut err = None;
    for result in results {
        match result {
            Ok(ChunkOpResult {
                result: Ok(n), ..
            }) => io_size += n as u64,
            Ok(ChunkOpResult {
                chunk_id,
                result: Err(e),
            }) => {
                error!("{} of chunk {} of '{}' failed: {}", op, chunk_id, path, e);
                ctx.stats.chunk_errors.fetch_add(1, Ordering::Relaxed);
                err.get_or_insert(FsError::from(e));
            }
            Err(e) => {
                error!("{} task for '{}' did not complete: {}", op, path, e);
                ctx.stats.chunk_errors.fetch_add(1, Ordering::Relaxed);
                err.get_or_insert(FsError::IoError);
            }
        }
    }
    (io_size, err)
}

pub async fn write(ctx: &DaemonContext, request: ChunkIoRequest, bulk: Bytes) -> IoResponse {
    ctx.stats.count(&ctx.stats.write_requests);
    let guard = ResponseGuard::new(&ctx.stats, "write", &request.path);

    if bulk.len() as u64 != request.total_chunk_size {
        error!(
            "Rejecting write of '{}': received {} bytes, request announces {}",
            request.path,
            bulk.len(),
            request.total_chunk_size
        );
        return guard.finish(Some(FsError::InvalidArgument), 0);
    }
    let segments = match plan_segments(ctx, "write", &request) {
        Ok(segments) => segments,
        Err(e) => return guard.finish(Some(e), 0),
    };
    let parts = match split_bulk(&segments, &bulk) {
        Ok(parts) => parts,
        Err(e) => return guard.finish(Some(e), 0),
    };

    let handles: Vec<_> = segments
        .iter()
        .zip(parts)
        .map(|(segment, data)| {
            let storage = Arc::clone(&ctx.storage);
            let path = request.path.clone();
            let segment = *segment;
            ctx.io_pool.submit("chunk-write", move || ChunkOpResult {
                chunk_id: segment.chunk_id,
                result: storage.write_chunk(&path, segment.chunk_id, &data, segment.chunk_offset),
            })
        })
        .collect();
    ctx.stats
        .chunk_writes
        .fetch_add(handles.len() as u64, Ordering::Relaxed);

    let (io_size, err) = collect_results(ctx, "write", &request.path, join_all(handles).await);
    ctx.stats.bytes_written.fetch_add(io_size, Ordering::Relaxed);
    guard.finish(err, io_size)
}

pub async fn read(ctx: &DaemonContext, request: ChunkIoRequest) -> ReadResponse {
    ctx.stats.count(&ctx.stats.read_requests);
    let guard = ResponseGuard::new(&ctx.stats, "read", &request.path);

    let segments = match plan_segments(ctx, "read", &request) {
        Ok(segments) => segments,
        Err(e) => {
            let response = guard.finish(Some(e), 0);
            return ReadResponse {
                err: response.err,
                io_size: 0,
                bulk: Bytes::new(),
            };
        }
    };

    // Unread bytes, including holes, stay zero.
    let mut local = BytesMut::zeroed(request.total_chunk_size as usize);
    let handles: Vec<_> = segments
        .iter()
        .map(|segment| {
            let mut part = local.split_to(segment.len as usize);
            let storage = Arc::clone(&ctx.storage);
            let path = request.path.clone();
            let segment = *segment;
            ctx.io_pool.submit("chunk-read", move || {
                let result =
                    storage.read_chunk(&path, segment.chunk_id, &mut part, segment.chunk_offset);
                (
                    part,
                    ChunkOpResult {
                        chunk_id: segment.chunk_id,
                        result,
                    },
                )
            })
        })
        .collect();
    ctx.stats
        .chunk_reads
        .fetch_add(handles.len() as u64, Ordering::Relaxed);

    let mut bulk = BytesMut::new();
    let mut results = Vec::with_capacity(handles.len());
    for (segment, joined) in segments.iter().zip(join_all(handles).await) {
        match joined {
            Ok((part, result)) => {
                bulk.unsplit(part);
                results.push(Ok(result));
            }
            Err(e) => {
                bulk.resize(bulk.len() + segment.len as usize, 0);
                results.push(Err(e));
            }
        }
    }

    let (io_size, err) = collect_results(ctx, "read", &request.path, results);
    ctx.stats.bytes_read.fetch_add(io_size, Ordering::Relaxed);
    let response = guard.finish(err, io_size);
    ReadResponse {
        err: response.err,
        io_size: response.io_size,
        bulk: bulk.freeze(),
    }
}

/// Cuts this daemon's chunks of `path` down to a file length of `length`.
pub async fn truncate(ctx: &DaemonContext, path: String, length: u64) -> FsResult<()> {
    ctx.stats.count(&ctx.stats.truncate_requests);
    let chunk_size = ctx.chunk_size();
    let storage = Arc::clone(&ctx.storage);
    let task_path = path.clone();
    let result = ctx
        .io_pool
        .run("chunk-truncate", move || {
            let mut chunk_start = block_index(length, chunk_size);
            let left = block_overrun(length, chunk_size);
            if left != 0 {
                storage.truncate_chunk_file(&task_path, chunk_start, left)?;
                chunk_start += 1;
            }
            storage.trim_chunk_space(&task_path, chunk_start)
        })
        .await;

    match result {
        Ok(Ok(())) => {
            debug!("Truncated local chunks of '{}' to {} bytes", path, length);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Truncate of '{}' to {} failed: {}", path, length, e);
            ctx.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
            Err(e.into())
        }
        Err(e) => {
            error!("Truncate task for '{}' did not complete: {}", path, e);
            ctx.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
            Err(FsError::IoError)
        }
    }
}

pub async fn chunk_stat(ctx: &DaemonContext) -> FsResult<ChunkStat> {
    let storage = Arc::clone(&ctx.storage);
    match ctx.io_pool.run("chunk-stat", move || storage.chunk_stat()).await {
        Ok(Ok(stat)) => Ok(stat),
        Ok(Err(e)) => {
            error!("Chunk storage stat failed: {}", e);
            Err(e.into())
        }
        Err(e) => {
            error!("Chunk stat task did not complete: {}", e);
            Err(FsError::IoError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::test_support;
    use crate::distributor::LocalOnlyDistributor;
    use crate::planner::IoPlan;

    const CHUNK_SIZE: u64 = 4096;

    fn single_host_request(path: &str, offset: u64, size: u64) -> ChunkIoRequest {
        let distributor = LocalOnlyDistributor::new(0);
        let plan = IoPlan::new(&distributor, path, offset, size, CHUNK_SIZE).unwrap();
        let target = &plan.targets[0];
        ChunkIoRequest {
            path: path.to_string(),
            offset: plan.lpad(),
            host_id: 0,
            host_size: 1,
            chunk_count: target.chunk_ids.len() as u64,
            chunk_start: plan.chunk_start,
            chunk_end: plan.chunk_end,
            total_chunk_size: target.total_chunk_size,
        }
    }

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_write_then_read_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), CHUNK_SIZE);

        let data = pattern(10_000);
        let request = single_host_request("/f", 1000, 10_000);
        let response = write(&ctx, request.clone(), data.clone()).await;
        assert_eq!(response, IoResponse { err: None, io_size: 10_000 });
        assert_eq!(ctx.storage.chunk_len("/f", 0), Some(CHUNK_SIZE));
        assert_eq!(ctx.storage.chunk_len("/f", 2), Some(11_000 - 2 * CHUNK_SIZE));

        let response = read(&ctx, request).await;
        assert_eq!(response.err, None);
        assert_eq!(response.io_size, 10_000);
        assert_eq!(response.bulk, data);
        assert_eq!(ctx.stats.in_flight.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.stats.chunk_writes.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_read_of_hole_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), CHUNK_SIZE);

        let response = read(&ctx, single_host_request("/sparse", 0, 5000)).await;
        assert_eq!(response.err, None);
        assert_eq!(response.io_size, 0);
        assert_eq!(response.bulk.len(), 5000);
        assert!(response.bulk.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_write_rejects_inconsistent_requests() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), CHUNK_SIZE);

        let request = single_host_request("/f", 0, 100);
        let response = write(&ctx, request.clone(), pattern(99)).await;
        assert_eq!(response.err, Some(FsError::InvalidArgument));
        assert_eq!(response.io_size, 0);

        let mut bad_host = request.clone();
        bad_host.host_size = 0;
        let response = write(&ctx, bad_host, pattern(100)).await;
        assert_eq!(response.err, Some(FsError::InvalidArgument));

        let mut bad_count = request;
        bad_count.chunk_count = 2;
        let response = write(&ctx, bad_count, pattern(100)).await;
        assert_eq!(response.err, Some(FsError::InvalidArgument));
        assert_eq!(ctx.stats.failed_requests.load(Ordering::Relaxed), 3);
        assert_eq!(ctx.storage.chunk_len("/f", 0), None);
    }

    #[tokio::test]
    async fn test_endless_chunk_range_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), CHUNK_SIZE);

        let mut request = single_host_request("/f", 0, 1);
        request.chunk_end = u64::MAX;
        let response = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            write(&ctx, request.clone(), pattern(1)),
        )
        .await
        .unwrap();
        assert_eq!(response.err, Some(FsError::InvalidArgument));
        assert_eq!(response.io_size, 0);

        let response = tokio::time::timeout(std::time::Duration::from_secs(5), read(&ctx, request))
            .await
            .unwrap();
        assert_eq!(response.err, Some(FsError::InvalidArgument));
        assert!(response.bulk.is_empty());
        assert_eq!(ctx.storage.chunk_len("/f", 0), None);
    }

    #[tokio::test]
    async fn test_storage_failure_reports_errno() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), CHUNK_SIZE);
        // a plain file where the chunk directory belongs
        std::fs::write(ctx.storage.root().join("blocked"), b"").unwrap();

        let response = write(&ctx, single_host_request("/blocked", 0, 100), pattern(100)).await;
        assert!(response.err.is_some());
        assert_ne!(response.err, Some(FsError::InvalidArgument));
        assert_eq!(response.io_size, 0);
        assert_eq!(ctx.stats.chunk_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_truncate_mid_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), CHUNK_SIZE);
        let request = single_host_request("/t", 0, 5 * CHUNK_SIZE);
        let response = write(&ctx, request, pattern(5 * CHUNK_SIZE as usize)).await;
        assert_eq!(response.err, None);

        truncate(&ctx, "/t".to_string(), CHUNK_SIZE + 10).await.unwrap();
        assert_eq!(ctx.storage.chunk_len("/t", 0), Some(CHUNK_SIZE));
        assert_eq!(ctx.storage.chunk_len("/t", 1), Some(10));
        assert_eq!(ctx.storage.chunk_len("/t", 2), None);
        assert_eq!(ctx.storage.chunk_len("/t", 4), None);

        // aligned length keeps no partial chunk
        truncate(&ctx, "/t".to_string(), CHUNK_SIZE).await.unwrap();
        assert_eq!(ctx.storage.chunk_len("/t", 0), Some(CHUNK_SIZE));
        assert_eq!(ctx.storage.chunk_len("/t", 1), None);

        // a path without chunks is fine
        truncate(&ctx, "/never".to_string(), 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_chunk_stat() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), CHUNK_SIZE);
        let stat = chunk_stat(&ctx).await.unwrap();
        assert_eq!(stat.chunk_size, CHUNK_SIZE);
        assert!(stat.chunk_total >= stat.chunk_free);
    }

    #[test]
    fn test_guard_counts_abandoned_requests() {
        let stats = DaemonStats::new();
        {
            let _guard = ResponseGuard::new(&stats, "write", "/x");
            assert_eq!(stats.in_flight.load(Ordering::Relaxed), 1);
        }
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 0);
        assert_eq!(stats.failed_requests.load(Ordering::Relaxed), 1);

        let response = ResponseGuard::new(&stats, "write", "/x").finish(None, 5);
        assert_eq!(response.io_size, 5);
        assert_eq!(stats.failed_requests.load(Ordering::Relaxed), 1);
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 0);
    }
}
