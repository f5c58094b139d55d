//! Client side of the file system: routes each request to the daemons that
//! own the affected metadata and chunks.

mod data;
mod metadata;

use crate::config::{FsSettings, Settings};
use crate::distributor::{Distributor, HostId};
use crate::error::{FsError, FsResult};
use crate::hosts::{self, HostEntry};
use crate::rpc::client::{ConnectionPool, Connector, TcpConnector};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a data request spread over several daemons.
///
/// Daemons that fail do not stop the others, so `io_size` counts every byte
/// that was transferred even when `err` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoOutcome {
    /// File offset the request was applied at. Differs from the requested
    /// offset for appends.
    pub offset: u64,
    pub io_size: u64,
    /// First error reported by any daemon.
    pub err: Option<FsError>,
}

impl IoOutcome {
    fn failed(offset: u64, err: FsError) -> Self {
        Self {
            offset,
            io_size: 0,
            err: Some(err),
        }
    }

    pub fn into_result(self) -> FsResult<u64> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(self.io_size),
        }
    }
}

pub struct Client {
    distributor: Arc<dyn Distributor>,
    rpc: ConnectionPool,
    fs: FsSettings,
}

impl Client {
    pub fn new(
        distributor: Arc<dyn Distributor>,
        connector: Arc<dyn Connector>,
        settings: &Settings,
    ) -> Self {
        Self {
            distributor,
            rpc: ConnectionPool::new(connector, &settings.rpc),
            fs: settings.fs.clone(),
        }
    }

    /// Builds a client for the daemons listed in the configured hosts file.
    pub fn connect(settings: &Settings) -> Result<Self> {
        let hosts = hosts::read_hosts(&settings.daemon.hosts_file)?;
        let localhost = local_host_id(&hosts, &hosts::local_hostname());
        let distributor = settings
            .placement
            .build(localhost, hosts.len() as u64)
            .context("Failed to set up data placement")?;
        info!(
            "Client using {} daemons from {} as host {}",
            hosts.len(),
            settings.daemon.hosts_file.display(),
            localhost
        );
        Ok(Self::new(
            distributor,
            Arc::new(TcpConnector::new(hosts)),
            settings,
        ))
    }

    pub fn hosts_size(&self) -> u64 {
        self.distributor.hosts_size()
    }

    pub fn chunk_size(&self) -> u64 {
        self.fs.chunk_size
    }

    fn all_hosts(&self) -> std::ops::Range<HostId> {
        0..self.distributor.hosts_size()
    }

    /// Checks that every daemon uses this client's chunk size.
    pub async fn verify_cluster(&self) -> FsResult<()> {
        for host in self.all_hosts() {
            let config = self.fs_config(host).await?;
            if config.chunk_size != self.fs.chunk_size {
                warn!(
                    "Host {} uses chunk size {}, client uses {}",
                    host, config.chunk_size, self.fs.chunk_size
                );
                return Err(FsError::InvalidArgument);
            }
        }
        Ok(())
    }
}

/// This machine's id when it also runs a daemon, host 0 otherwise.
fn local_host_id(hosts: &[HostEntry], hostname: &str) -> HostId {
    hosts
        .iter()
        .find(|h| h.hostname == hostname)
        .map(|h| h.id)
        .unwrap_or(0)
}

/// Keeps the first error of a fan-out.
fn first_error(results: impl IntoIterator<Item = FsResult<()>>) -> FsResult<()> {
    let mut first = Ok(());
    for result in results {
        if let Err(e) = result
            && first.is_ok()
        {
            first = Err(e);
        }
    }
    first
}
