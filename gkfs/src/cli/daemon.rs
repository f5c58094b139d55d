use anyhow::{Context, Result, bail};
use gkfs::config::Settings;
use gkfs::daemon::DaemonContext;
use gkfs::hosts::{self, HostRegistration};
use gkfs::metadata::{MemoryBackend, Metadata, MetadataError};
use gkfs::rpc::server::{GkfsRpcImpl, serve_listener};
use gkfs::task::spawn_named;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const METADATA_SNAPSHOT: &str = "metadata.bin";
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct DaemonOverrides {
    pub listen: Option<SocketAddr>,
    pub rootdir: Option<PathBuf>,
    pub hosts_file: Option<PathBuf>,
}

impl DaemonOverrides {
    fn apply(self, settings: &mut Settings) {
        if let Some(listen) = self.listen {
            settings.daemon.listen = listen;
        }
        if let Some(rootdir) = self.rootdir {
            settings.daemon.rootdir = rootdir;
        }
        if let Some(hosts_file) = self.hosts_file {
            settings.daemon.hosts_file = hosts_file;
        }
    }
}

pub async fn run_daemon(config_path: PathBuf, overrides: DaemonOverrides) -> Result<()> {
    let mut settings = Settings::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut settings);

    let metadir = settings.daemon.metadir();
    std::fs::create_dir_all(&metadir)
        .with_context(|| format!("Failed to create metadata directory {}", metadir.display()))?;
    let snapshot_path = metadir.join(METADATA_SNAPSHOT);
    let backend = Arc::new(
        MemoryBackend::load(&snapshot_path)
            .with_context(|| format!("Failed to load metadata from {}", snapshot_path.display()))?,
    );

    let ctx = Arc::new(
        DaemonContext::new(&settings, backend.clone()).context("Failed to open chunk storage")?,
    );
    match ctx
        .metadata
        .create("/", Metadata::new(libc::S_IFDIR | 0o755), true)
        .await
    {
        Ok(()) | Err(MetadataError::Exists(_)) => {}
        Err(e) => bail!("Failed to create root directory entry: {}", e),
    }

    let listener = TcpListener::bind(settings.daemon.listen)
        .await
        .with_context(|| format!("Failed to bind RPC TCP server to {}", settings.daemon.listen))?;
    let advertise = match settings.daemon.advertise {
        Some(addr) => addr,
        None => listener
            .local_addr()
            .context("Failed to read RPC listener address")?,
    };
    let registration = HostRegistration::register(
        &settings.daemon.hosts_file,
        &hosts::local_hostname(),
        advertise,
    )?;

    let shutdown = CancellationToken::new();
    let server = spawn_named(
        "rpc-server",
        serve_listener(listener, GkfsRpcImpl::new(Arc::clone(&ctx)), shutdown.clone()),
    );

    let stats_ctx = Arc::clone(&ctx);
    let stats_shutdown = shutdown.clone();
    spawn_named("stats-reporter", async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stats_shutdown.cancelled() => break,
                _ = interval.tick() => stats_ctx.stats.output_report_debug(),
            }
        }
    });

    info!(
        "gkfs daemon running on {} (mountdir {}, rootdir {})",
        advertise,
        settings.daemon.mountdir.display(),
        settings.daemon.rootdir.display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping daemon");
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("RPC server stopped with error: {:#}", e),
        Err(e) => error!("RPC server task failed: {}", e),
    }
    drop(registration);

    backend
        .snapshot(&snapshot_path)
        .await
        .with_context(|| format!("Failed to write metadata to {}", snapshot_path.display()))?;
    info!("Final statistics:\n{}", ctx.stats.report());
    Ok(())
}
