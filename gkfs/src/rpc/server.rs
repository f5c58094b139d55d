use crate::daemon::{DaemonContext, handler, metadentry};
use crate::error::FsError;
use crate::metadata::{Dirent, DirentExtended, Metadata, MetadataUpdate};
use crate::planner::MAX_HOST_TRANSFER;
use crate::rpc::{ChunkIoRequest, FsConfig, GkfsRpc, IoResponse, ReadResponse, RemovedEntry};
use crate::storage::ChunkStat;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::prelude::*;
use std::sync::Arc;
use tarpc::server::{self, Channel};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Largest frame accepted on a connection: one host's transfer buffer plus
/// room for the request envelope.
const MAX_FRAME_LENGTH: usize = MAX_HOST_TRANSFER as usize + (1 << 20);

#[derive(Clone)]
pub struct GkfsRpcImpl {
    ctx: Arc<DaemonContext>,
}

impl GkfsRpcImpl {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }
}

impl GkfsRpc for GkfsRpcImpl {
    async fn create(
        self,
        _context: tarpc::context::Context,
        path: String,
        mode: u32,
    ) -> Result<(), FsError> {
        metadentry::create(&self.ctx, &path, mode).await
    }

    async fn stat(self, _context: tarpc::context::Context, path: String) -> Result<Metadata, FsError> {
        metadentry::stat(&self.ctx, &path).await
    }

    async fn remove_metadata(
        self,
        _context: tarpc::context::Context,
        path: String,
    ) -> Result<RemovedEntry, FsError> {
        metadentry::remove_metadata(&self.ctx, &path).await
    }

    async fn remove_data(self, _context: tarpc::context::Context, path: String) -> Result<(), FsError> {
        metadentry::remove_data(&self.ctx, &path).await
    }

    async fn update_metadentry(
        self,
        _context: tarpc::context::Context,
        path: String,
        update: MetadataUpdate,
    ) -> Result<(), FsError> {
        metadentry::update_metadentry(&self.ctx, &path, &update).await
    }

    async fn update_metadentry_size(
        self,
        _context: tarpc::context::Context,
        path: String,
        size: u64,
        offset: u64,
        append: bool,
    ) -> Result<u64, FsError> {
        metadentry::update_metadentry_size(&self.ctx, &path, size, offset, append).await
    }

    async fn get_metadentry_size(
        self,
        _context: tarpc::context::Context,
        path: String,
    ) -> Result<u64, FsError> {
        metadentry::get_metadentry_size(&self.ctx, &path).await
    }

    async fn decr_size(
        self,
        _context: tarpc::context::Context,
        path: String,
        length: u64,
    ) -> Result<(), FsError> {
        metadentry::decr_size(&self.ctx, &path, length).await
    }

    async fn get_dirents(
        self,
        _context: tarpc::context::Context,
        path: String,
        buffer_size: u64,
    ) -> Result<Vec<Dirent>, FsError> {
        metadentry::get_dirents(&self.ctx, &path, buffer_size).await
    }

    async fn get_dirents_extended(
        self,
        _context: tarpc::context::Context,
        path: String,
        buffer_size: u64,
    ) -> Result<Vec<DirentExtended>, FsError> {
        metadentry::get_dirents_extended(&self.ctx, &path, buffer_size).await
    }

    async fn write(
        self,
        _context: tarpc::context::Context,
        request: ChunkIoRequest,
        bulk: Bytes,
    ) -> IoResponse {
        handler::write(&self.ctx, request, bulk).await
    }

    async fn read(self, _context: tarpc::context::Context, request: ChunkIoRequest) -> ReadResponse {
        handler::read(&self.ctx, request).await
    }

    async fn truncate(
        self,
        _context: tarpc::context::Context,
        path: String,
        length: u64,
    ) -> Result<(), FsError> {
        handler::truncate(&self.ctx, path, length).await
    }

    async fn chunk_stat(self, _context: tarpc::context::Context) -> Result<ChunkStat, FsError> {
        handler::chunk_stat(&self.ctx).await
    }

    async fn fs_config(self, _context: tarpc::context::Context) -> FsConfig {
        self.ctx.fs_config()
    }

    async fn stats(self, _context: tarpc::context::Context) -> String {
        self.ctx.stats.report()
    }
}

pub fn length_delimited_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub async fn serve_listener(
    listener: TcpListener,
    service: GkfsRpcImpl,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Failed to read RPC listener address")?;
    info!("RPC server listening on {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("RPC TCP server shutting down on {}", addr);
                break;
            }
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept RPC TCP connection: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }

                let service = service.clone();
                let client_shutdown = shutdown.clone();
                crate::task::spawn_named("rpc-connection", async move {
                    let framed = Framed::new(stream, length_delimited_codec());
                    let transport = tarpc::serde_transport::new(
                        framed,
                        tarpc::tokio_serde::formats::Bincode::default(),
                    );

                    let channel = server::BaseChannel::new(server::Config::default(), transport);

                    debug!("RPC client connected from {}", peer_addr);

                    tokio::select! {
                        _ = client_shutdown.cancelled() => {
                            debug!("RPC client handler shutting down");
                        }
                        _ = channel
                            .execute(service.serve())
                            .for_each(|response| async move {
                                tokio::spawn(response);
                            }) => {
                            debug!("RPC client disconnected from {}", peer_addr);
                        }
                    }
                });
            }
        }
    }

    Ok(())
}
