use super::{Client, first_error};
use crate::distributor::HostId;
use crate::error::{FsError, FsResult};
use crate::metadata::{Dirent, DirentExtended, Metadata, MetadataUpdate};
use crate::rpc::{FsConfig, RemovedEntry};
use std::collections::BTreeMap;
use tarpc::context;
use tracing::{debug, error};

fn is_regular(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFREG
}

impl Client {
    pub async fn create(&self, path: &str, mode: u32) -> FsResult<()> {
        let host = self.distributor.locate_file_metadata(path);
        let path = path.to_string();
        self.rpc
            .call_once(host, "create", |client| {
                let path = path.clone();
                async move { client.create(context::current(), path, mode).await }
            })
            .await?
    }

    pub async fn stat(&self, path: &str) -> FsResult<Metadata> {
        let host = self.distributor.locate_file_metadata(path);
        let path = path.to_string();
        self.rpc
            .call(host, "stat", |client| {
                let path = path.clone();
                async move { client.stat(context::current(), path).await }
            })
            .await?
    }

    pub async fn get_size(&self, path: &str) -> FsResult<u64> {
        let host = self.distributor.locate_file_metadata(path);
        let path = path.to_string();
        self.rpc
            .call(host, "get_metadentry_size", |client| {
                let path = path.clone();
                async move { client.get_metadentry_size(context::current(), path).await }
            })
            .await?
    }

    pub async fn update_metadentry(&self, path: &str, update: MetadataUpdate) -> FsResult<()> {
        let host = self.distributor.locate_file_metadata(path);
        let path = path.to_string();
        self.rpc
            .call(host, "update_metadentry", |client| {
                let path = path.clone();
                let update = update.clone();
                async move { client.update_metadentry(context::current(), path, update).await }
            })
            .await?
    }

    /// Removes `path`. Directories must be empty. Chunks of a regular file
    /// are dropped on every daemon.
    pub async fn remove(&self, path: &str) -> FsResult<RemovedEntry> {
        let md = self.stat(path).await?;
        if md.is_dir() && !self.get_dirents(path).await?.is_empty() {
            return Err(FsError::NotEmpty);
        }

        let md_host = self.distributor.locate_file_metadata(path);
        let owned_path = path.to_string();
        let removed = self
            .rpc
            .call_once(md_host, "remove_metadata", |client| {
                let path = owned_path.clone();
                async move { client.remove_metadata(context::current(), path).await }
            })
            .await??;

        if is_regular(removed.mode) && removed.size != 0 {
            // the metadata owner already dropped its chunks
            let skip = self.fs.implicit_data_removal.then_some(md_host);
            let hosts: Vec<HostId> = self.all_hosts().filter(|h| Some(*h) != skip).collect();
            let calls = hosts.iter().map(|host| {
                let path = owned_path.clone();
                self.rpc.call(*host, "remove_data", move |client| {
                    let path = path.clone();
                    async move { client.remove_data(context::current(), path).await }
                })
            });
            let results = futures::future::join_all(calls).await;
            first_error(results.into_iter().map(|r| r.and_then(|inner| inner)))?;
        }
        debug!("Removed '{}' ({} bytes)", path, removed.size);
        Ok(removed)
    }

    /// Entries of a directory, collected from every daemon.
    pub async fn get_dirents(&self, path: &str) -> FsResult<Vec<Dirent>> {
        let buffer_size = self.fs.dirents_buff_size;
        let calls = self
            .distributor
            .locate_directory_metadata(path)
            .into_iter()
            .map(|host| {
                let path = path.to_string();
                self.rpc.call(host, "get_dirents", move |client| {
                    let path = path.clone();
                    async move { client.get_dirents(context::current(), path, buffer_size).await }
                })
            });
        let mut merged = BTreeMap::new();
        for (host, result) in futures::future::join_all(calls).await.into_iter().enumerate() {
            let entries = result.and_then(|inner| inner).inspect_err(|e| {
                error!("Listing '{}' on host {} failed: {}", path, host, e);
            })?;
            for entry in entries {
                merged.insert(entry.name.clone(), entry);
            }
        }
        Ok(merged.into_values().collect())
    }

    pub async fn get_dirents_extended(&self, path: &str) -> FsResult<Vec<DirentExtended>> {
        let buffer_size = self.fs.dirents_buff_size;
        let calls = self
            .distributor
            .locate_directory_metadata(path)
            .into_iter()
            .map(|host| {
                let path = path.to_string();
                self.rpc.call(host, "get_dirents_extended", move |client| {
                    let path = path.clone();
                    async move {
                        client
                            .get_dirents_extended(context::current(), path, buffer_size)
                            .await
                    }
                })
            });
        let mut merged = BTreeMap::new();
        for (host, result) in futures::future::join_all(calls).await.into_iter().enumerate() {
            let entries = result.and_then(|inner| inner).inspect_err(|e| {
                error!("Extended listing of '{}' on host {} failed: {}", path, host, e);
            })?;
            for entry in entries {
                merged.insert(entry.name.clone(), entry);
            }
        }
        Ok(merged.into_values().collect())
    }

    pub async fn fs_config(&self, host: HostId) -> FsResult<FsConfig> {
        self.rpc
            .call(host, "fs_config", |client| async move {
                client.fs_config(context::current()).await
            })
            .await
    }

    /// Rendered statistics report of one daemon.
    pub async fn daemon_stats(&self, host: HostId) -> FsResult<String> {
        self.rpc
            .call(host, "stats", |client| async move {
                client.stats(context::current()).await
            })
            .await
    }
}
