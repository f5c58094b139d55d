use super::{Client, IoOutcome, first_error};
use crate::arithmetic::block_index;
use crate::distributor::HostId;
use crate::error::{FsError, FsResult};
use crate::planner::{IoPlan, TargetPlan};
use crate::rpc::{ChunkIoRequest, IoResponse, ReadResponse};
use crate::storage::ChunkStat;
use bytes::Bytes;
use std::collections::BTreeSet;
use tarpc::context;
use tracing::{debug, error};

/// Widest chunk range a truncate resolves to its owning hosts.
const TRUNCATE_SCAN_CHUNKS: u64 = 1 << 16;

impl Client {
    fn chunk_request(&self, plan: &IoPlan, target: &TargetPlan) -> ChunkIoRequest {
        ChunkIoRequest {
            path: plan.path.clone(),
            offset: plan.lpad(),
            host_id: target.host,
            host_size: self.distributor.hosts_size(),
            chunk_count: target.chunk_ids.len() as u64,
            chunk_start: plan.chunk_start,
            chunk_end: plan.chunk_end,
            total_chunk_size: target.total_chunk_size,
        }
    }

    fn plan(&self, path: &str, offset: u64, size: u64) -> FsResult<IoPlan> {
        IoPlan::new(&*self.distributor, path, offset, size, self.fs.chunk_size).map_err(|e| {
            error!("Cannot plan I/O on '{}': {}", path, e);
            FsError::from(e)
        })
    }

    /// Writes `buf` at `offset`, or at the end of the file for appends.
    ///
    /// The file size is updated at the metadata owner before any data moves,
    /// which also reserves the range of an append.
    pub async fn write(&self, path: &str, buf: &[u8], offset: u64, append: bool) -> IoOutcome {
        let size = buf.len() as u64;
        let md_host = self.distributor.locate_file_metadata(path);
        let path_owned = path.to_string();
        let update = |client: crate::rpc::GkfsRpcClient| {
            let path = path_owned.clone();
            async move {
                client
                    .update_metadentry_size(context::current(), path, size, offset, append)
                    .await
            }
        };
        let updated = if append {
            self.rpc.call_once(md_host, "update_metadentry_size", update).await
        } else {
            self.rpc.call(md_host, "update_metadentry_size", update).await
        };
        let offset = match updated.and_then(|r| r) {
            Ok(new_size) if append => new_size.saturating_sub(size),
            Ok(_) => offset,
            Err(e) => {
                error!("Size update of '{}' failed: {}", path, e);
                return IoOutcome::failed(offset, e);
            }
        };
        if size == 0 {
            return IoOutcome {
                offset,
                io_size: 0,
                err: None,
            };
        }

        let plan = match self.plan(path, offset, size) {
            Ok(plan) => plan,
            Err(e) => return IoOutcome::failed(offset, e),
        };
        let mut calls = Vec::with_capacity(plan.targets.len());
        for target in &plan.targets {
            let bulk = match plan
                .bulk_region(&*self.distributor, target)
                .map_err(FsError::from)
                .and_then(|region| Ok(Bytes::from(region.gather(buf)?)))
            {
                Ok(bulk) => bulk,
                Err(e) => return IoOutcome::failed(offset, e),
            };
            let request = self.chunk_request(&plan, target);
            let host = target.host;
            calls.push(self.rpc.call(host, "write", move |client| {
                let request = request.clone();
                let bulk = bulk.clone();
                async move { client.write(context::current(), request, bulk).await }
            }));
        }
        let responses = futures::future::join_all(calls).await;

        let mut outcome = IoOutcome {
            offset,
            io_size: 0,
            err: None,
        };
        for (target, response) in plan.targets.iter().zip(responses) {
            match response {
                Ok(IoResponse { err, io_size }) => {
                    outcome.io_size += io_size;
                    if let Some(e) = err {
                        error!(
                            "Write of '{}' on host {} failed after {} bytes: {}",
                            path, target.host, io_size, e
                        );
                        outcome.err.get_or_insert(e);
                    }
                }
                Err(e) => {
                    error!("Write of '{}' on host {} failed: {}", path, target.host, e);
                    outcome.err.get_or_insert(e);
                }
            }
        }
        debug!(
            "Wrote {} of {} bytes of '{}' at {} over {} hosts",
            outcome.io_size,
            size,
            path,
            offset,
            plan.targets.len()
        );
        outcome
    }

    /// Reads into `buf` from `offset`. Regions no daemon returned data for keep
    /// their previous content unless `zero_buffer_before_read` is set.
    pub async fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> IoOutcome {
        if self.fs.zero_buffer_before_read {
            buf.fill(0);
        }
        let size = buf.len() as u64;
        if size == 0 {
            return IoOutcome {
                offset,
                io_size: 0,
                err: None,
            };
        }
        let plan = match self.plan(path, offset, size) {
            Ok(plan) => plan,
            Err(e) => return IoOutcome::failed(offset, e),
        };

        let mut regions = Vec::with_capacity(plan.targets.len());
        let mut calls = Vec::with_capacity(plan.targets.len());
        for target in &plan.targets {
            match plan.bulk_region(&*self.distributor, target) {
                Ok(region) => regions.push(region),
                Err(e) => return IoOutcome::failed(offset, e.into()),
            }
            let request = self.chunk_request(&plan, target);
            calls.push(self.rpc.call(target.host, "read", move |client| {
                let request = request.clone();
                async move { client.read(context::current(), request).await }
            }));
        }
        let responses = futures::future::join_all(calls).await;

        let mut outcome = IoOutcome {
            offset,
            io_size: 0,
            err: None,
        };
        for ((target, region), response) in plan.targets.iter().zip(&regions).zip(responses) {
            let ReadResponse { err, io_size, bulk } = match response {
                Ok(response) => response,
                Err(e) => {
                    error!("Read of '{}' on host {} failed: {}", path, target.host, e);
                    outcome.err.get_or_insert(e);
                    continue;
                }
            };
            if let Some(e) = err {
                error!(
                    "Read of '{}' on host {} failed after {} bytes: {}",
                    path, target.host, io_size, e
                );
                outcome.err.get_or_insert(e);
            }
            if bulk.is_empty() && region.local_len() != 0 {
                continue;
            }
            match region.scatter(&bulk, buf) {
                Ok(()) => outcome.io_size += io_size,
                Err(e) => {
                    error!(
                        "Host {} returned a malformed read buffer for '{}': {}",
                        target.host, path, e
                    );
                    outcome.err.get_or_insert(FsError::IoError);
                }
            }
        }
        outcome
    }

    /// Shrinks `path` to `new_size` bytes.
    pub async fn truncate(&self, path: &str, new_size: u64) -> FsResult<()> {
        let md_host = self.distributor.locate_file_metadata(path);
        let old_size = self.get_size(path).await?;
        if new_size > old_size {
            debug!(
                "Refusing to grow '{}' from {} to {} by truncate",
                path, old_size, new_size
            );
            return Err(FsError::InvalidArgument);
        }
        if new_size == old_size {
            return Ok(());
        }

        let owned_path = path.to_string();
        self.rpc
            .call(md_host, "decr_size", |client| {
                let path = owned_path.clone();
                async move { client.decr_size(context::current(), path, new_size).await }
            })
            .await??;

        let hosts = self.hosts_with_chunks(path, new_size, old_size);
        let calls = hosts.iter().map(|host| {
            let path = owned_path.clone();
            self.rpc.call(*host, "truncate", move |client| {
                let path = path.clone();
                async move { client.truncate(context::current(), path, new_size).await }
            })
        });
        let results = futures::future::join_all(calls).await;
        first_error(results.into_iter().map(|r| r.and_then(|inner| inner)))
    }

    /// Hosts owning any chunk in `[block_index(from), block_index(to - 1)]`.
    ///
    /// Ranges wider than [`TRUNCATE_SCAN_CHUNKS`] go to every host instead of
    /// being hashed chunk by chunk.
    fn hosts_with_chunks(&self, path: &str, from: u64, to: u64) -> BTreeSet<HostId> {
        let chunk_size = self.fs.chunk_size;
        let first = block_index(from, chunk_size);
        let last = block_index(to - 1, chunk_size);
        if last - first >= TRUNCATE_SCAN_CHUNKS {
            return self.all_hosts().collect();
        }
        let mut hosts = BTreeSet::new();
        for chunk_id in first..=last {
            hosts.insert(self.distributor.locate_data(path, chunk_id));
            if hosts.len() as u64 == self.distributor.hosts_size() {
                break;
            }
        }
        hosts
    }

    /// Storage capacity summed over all daemons.
    pub async fn chunk_stat(&self) -> FsResult<ChunkStat> {
        let calls = self.all_hosts().map(|host| {
            self.rpc.call(host, "chunk_stat", |client| async move {
                client.chunk_stat(context::current()).await
            })
        });
        let results = futures::future::join_all(calls).await;

        let mut total = ChunkStat {
            chunk_size: self.fs.chunk_size,
            chunk_total: 0,
            chunk_free: 0,
        };
        for (host, result) in results.into_iter().enumerate() {
            let stat = result.and_then(|inner| inner)?;
            if stat.chunk_size != total.chunk_size {
                error!(
                    "Host {} reports chunk size {}, expected {}",
                    host, stat.chunk_size, total.chunk_size
                );
                return Err(FsError::IoError);
            }
            total.chunk_total += stat.chunk_total;
            total.chunk_free += stat.chunk_free;
        }
        Ok(total)
    }
}
