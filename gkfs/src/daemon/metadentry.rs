//! Metadata requests served by a path's metadata owner.

use super::DaemonContext;
use crate::error::{FsError, FsResult};
use crate::metadata::{Dirent, DirentExtended, Metadata, MetadataError, MetadataUpdate};
use crate::rpc::RemovedEntry;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

fn reject(op: &str, path: &str, e: MetadataError) -> FsError {
    match &e {
        MetadataError::NotFound(_) | MetadataError::Exists(_) => {
            debug!("{} of '{}': {}", op, path, e)
        }
        _ => error!("{} of '{}' failed: {}", op, path, e),
    }
    e.into()
}

pub async fn create(ctx: &DaemonContext, path: &str, mode: u32) -> FsResult<()> {
    ctx.stats.count(&ctx.stats.creates);
    ctx.metadata
        .create(path, Metadata::new(mode), ctx.fs.create_exist_check)
        .await
        .map_err(|e| reject("create", path, e))
}

pub async fn stat(ctx: &DaemonContext, path: &str) -> FsResult<Metadata> {
    ctx.stats.count(&ctx.stats.stats);
    ctx.metadata
        .get(path)
        .await
        .map_err(|e| reject("stat", path, e))
}

/// Drops the record, and with implicit data removal also this daemon's chunks
/// of a non-empty regular file.
pub async fn remove_metadata(ctx: &DaemonContext, path: &str) -> FsResult<RemovedEntry> {
    ctx.stats.count(&ctx.stats.removes);
    let md = ctx
        .metadata
        .remove(path)
        .await
        .map_err(|e| reject("remove", path, e))?;
    if ctx.fs.implicit_data_removal && md.is_regular() && md.size != 0 {
        remove_data(ctx, path).await?;
    }
    Ok(RemovedEntry {
        mode: md.mode,
        size: md.size,
    })
}

pub async fn remove_data(ctx: &DaemonContext, path: &str) -> FsResult<()> {
    let storage = Arc::clone(&ctx.storage);
    let task_path = path.to_string();
    match ctx
        .io_pool
        .run("chunk-destroy", move || storage.destroy_chunk_space(&task_path))
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Removing chunks of '{}' failed: {}", path, e);
            Err(e.into())
        }
        Err(e) => {
            error!("Chunk removal task for '{}' did not complete: {}", path, e);
            Err(FsError::IoError)
        }
    }
}

pub async fn update_metadentry(
    ctx: &DaemonContext,
    path: &str,
    update: &MetadataUpdate,
) -> FsResult<()> {
    ctx.metadata
        .update(path, update)
        .await
        .map_err(|e| reject("update", path, e))
}

pub async fn update_metadentry_size(
    ctx: &DaemonContext,
    path: &str,
    size: u64,
    offset: u64,
    append: bool,
) -> FsResult<u64> {
    ctx.stats.count(&ctx.stats.size_updates);
    ctx.metadata
        .update_size(path, size, offset, append)
        .await
        .map_err(|e| reject("size update", path, e))
}

pub async fn get_metadentry_size(ctx: &DaemonContext, path: &str) -> FsResult<u64> {
    ctx.metadata
        .get_size(path)
        .await
        .map_err(|e| reject("size lookup", path, e))
}

pub async fn decr_size(ctx: &DaemonContext, path: &str, length: u64) -> FsResult<()> {
    ctx.stats.count(&ctx.stats.size_updates);
    ctx.metadata
        .decrease_size(path, length)
        .await
        .map_err(|e| reject("size decrease", path, e))
}

/// The listing must fit the caller's buffer as a whole.
fn check_fits<T: Serialize>(path: &str, entries: &T, buffer_size: u64) -> FsResult<()> {
    let needed = bincode::serialized_size(entries).map_err(|e| {
        error!("Cannot size listing of '{}': {}", path, e);
        FsError::IoError
    })?;
    if needed > buffer_size {
        warn!(
            "Listing of '{}' needs {} bytes, caller offers {}",
            path, needed, buffer_size
        );
        return Err(FsError::NoBufferSpace);
    }
    Ok(())
}

pub async fn get_dirents(
    ctx: &DaemonContext,
    path: &str,
    buffer_size: u64,
) -> FsResult<Vec<Dirent>> {
    ctx.stats.count(&ctx.stats.dirent_listings);
    let entries = ctx
        .metadata
        .get_dirents(path)
        .await
        .map_err(|e| reject("listing", path, e))?;
    check_fits(path, &entries, buffer_size)?;
    Ok(entries)
}

pub async fn get_dirents_extended(
    ctx: &DaemonContext,
    path: &str,
    buffer_size: u64,
) -> FsResult<Vec<DirentExtended>> {
    ctx.stats.count(&ctx.stats.dirent_listings);
    let entries = ctx
        .metadata
        .get_dirents_extended(path)
        .await
        .map_err(|e| reject("extended listing", path, e))?;
    check_fits(path, &entries, buffer_size)?;
    Ok(entries)
}
