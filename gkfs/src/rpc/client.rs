use crate::config::RpcConfig;
use crate::distributor::HostId;
use crate::error::{FsError, FsResult};
use crate::hosts::HostEntry;
use crate::rpc::GkfsRpcClient;
use crate::rpc::server::length_delimited_codec;
use async_trait::async_trait;
use moka::sync::Cache;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tarpc::client::RpcError;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Opens a new RPC client for a host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: HostId) -> io::Result<GkfsRpcClient>;
}

/// Connects over TCP to the addresses listed in the hosts file.
pub struct TcpConnector {
    hosts: Vec<HostEntry>,
}

impl TcpConnector {
    pub fn new(hosts: Vec<HostEntry>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: HostId) -> io::Result<GkfsRpcClient> {
        let entry = self.hosts.get(host as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("host {} is not in the hosts file", host),
            )
        })?;
        let stream = TcpStream::connect(entry.addr).await?;
        stream.set_nodelay(true)?;
        let framed = Framed::new(stream, length_delimited_codec());
        let transport = tarpc::serde_transport::new(
            framed,
            tarpc::tokio_serde::formats::Bincode::default(),
        );
        debug!("Connected to host {} ({}) at {}", host, entry.hostname, entry.addr);
        Ok(GkfsRpcClient::new(tarpc::client::Config::default(), transport).spawn())
    }
}

/// Cached clients for all hosts of the cluster, shared by every task of the
/// process.
///
/// Calls are bounded by `rpc.timeout_ms` and by tarpc's own request deadline
/// of ten seconds, whichever is shorter. A failed call drops the cached
/// client so the next attempt reconnects.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    clients: Cache<HostId, GkfsRpcClient>,
    timeout: Duration,
    retries: u32,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: &RpcConfig) -> Self {
        Self {
            connector,
            clients: Cache::new(config.connection_cache),
            timeout: config.timeout(),
            retries: config.retries,
        }
    }

    async fn client(&self, host: HostId) -> FsResult<GkfsRpcClient> {
        if let Some(client) = self.clients.get(&host) {
            return Ok(client);
        }
        let client = match tokio::time::timeout(self.timeout, self.connector.connect(host)).await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                warn!("Failed to connect to host {}: {}", host, e);
                return Err(match e.kind() {
                    io::ErrorKind::InvalidInput => FsError::InvalidArgument,
                    _ => FsError::Busy,
                });
            }
            Err(_) => {
                warn!("Connecting to host {} timed out after {:?}", host, self.timeout);
                return Err(FsError::Busy);
            }
        };
        self.clients.insert(host, client.clone());
        Ok(client)
    }

    async fn attempt<T, F, Fut>(&self, host: HostId, op: &str, call: &F) -> FsResult<T>
    where
        F: Fn(GkfsRpcClient) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let client = self.client(host).await?;
        match tokio::time::timeout(self.timeout, call(client)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("{} on host {} failed: {}", op, host, e);
                self.clients.invalidate(&host);
                Err(FsError::Busy)
            }
            Err(_) => {
                warn!("{} on host {} timed out after {:?}", op, host, self.timeout);
                self.clients.invalidate(&host);
                Err(FsError::Busy)
            }
        }
    }

    /// Issues `call` against `host`, retrying transport failures and timeouts
    /// up to the configured number of times.
    pub async fn call<T, F, Fut>(&self, host: HostId, op: &str, call: F) -> FsResult<T>
    where
        F: Fn(GkfsRpcClient) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut last = FsError::Busy;
        for attempt in 0..=self.retries {
            match self.attempt(host, op, &call).await {
                Ok(value) => return Ok(value),
                Err(FsError::Busy) => {
                    debug!(
                        "{} on host {}: attempt {} of {} failed",
                        op,
                        host,
                        attempt + 1,
                        self.retries + 1
                    );
                    last = FsError::Busy;
                }
                Err(e) => {
                    last = e;
                    break;
                }
            }
        }
        Err(last)
    }

    /// Issues `call` once. For requests that must not be applied twice.
    pub async fn call_once<T, F, Fut>(&self, host: HostId, op: &str, call: F) -> FsResult<T>
    where
        F: Fn(GkfsRpcClient) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        self.attempt(host, op, &call).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::rpc::GkfsRpc;
    use crate::rpc::server::GkfsRpcImpl;
    use futures::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tarpc::server::{BaseChannel, Channel};

    /// Serves each host from an in-process daemon over tarpc's in-memory
    /// transport. `None` hosts accept requests and never answer.
    pub struct ChannelConnector {
        servers: Vec<Option<GkfsRpcImpl>>,
        pub connects: AtomicU64,
    }

    impl ChannelConnector {
        pub fn new(servers: Vec<Option<GkfsRpcImpl>>) -> Self {
            Self {
                servers,
                connects: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl Connector for ChannelConnector {
        async fn connect(&self, host: HostId) -> io::Result<GkfsRpcClient> {
            let server = self
                .servers
                .get(host as usize)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown host"))?
                .clone();
            self.connects.fetch_add(1, Ordering::Relaxed);

            let (client_transport, server_transport) = tarpc::transport::channel::unbounded();
            match server {
                Some(server) => {
                    tokio::spawn(
                        BaseChannel::with_defaults(server_transport)
                            .execute(server.serve())
                            .for_each(|response| async move {
                                tokio::spawn(response);
                            }),
                    );
                }
                None => {
                    tokio::spawn(async move {
                        let _held = server_transport;
                        future::pending::<()>().await;
                    });
                }
            }
            Ok(GkfsRpcClient::new(tarpc::client::Config::default(), client_transport).spawn())
        }
    }
}
