//! Download wrapper around the transfer engine

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tempfile::TempDir;

use super::config::EngineConfig;
use super::engine::TransferEngine;
use super::transport::{TokioScheduler, UdpEndpoint};

/// TFTP client
///
/// Downloads go through a running [`TransferEngine`], so they queue behind
/// any other exchange with the same peer.
///
/// # Example
///
/// ```rust,no_run
/// # async fn demo(engine: std::sync::Arc<tftpmux::tftp::TransferEngine>) -> anyhow::Result<()> {
/// use tftpmux::tftp::Client;
/// use std::path::Path;
///
/// let client = Client::new(engine, "192.168.1.100:6969".parse()?);
///
/// // Download file
/// client.get("remote.txt", Path::new("local.txt")).await?;
///
/// // Download directory as a tar archive
/// client.get("dir:photos", Path::new("photos.tar")).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    engine: Arc<TransferEngine>,
    server: SocketAddr,
}

impl Client {
    pub fn new(engine: Arc<TransferEngine>, server: SocketAddr) -> Self {
        Self { engine, server }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Download a file from the server (RRQ - Read Request)
    ///
    /// # Arguments
    ///
    /// * `remote_file` - File name on the server, `dir:` prefixed for directories
    /// * `local_file` - Local save path
    ///
    /// Returns the number of bytes written.
    pub async fn get(&self, remote_file: &str, local_file: &Path) -> anyhow::Result<u64> {
        log::info!("Downloading {} to {}", remote_file, local_file.display());

        let data = self.engine.download(remote_file, self.server).await?;
        tokio::fs::write(local_file, &data)
            .await
            .with_context(|| format!("Failed to write {}", local_file.display()))?;

        log::info!("Download complete: {} ({} bytes)", local_file.display(), data.len());
        Ok(data.len() as u64)
    }
}

/// Point `config` at a fresh empty root so a download-only node serves nothing.
///
/// The directory lives as long as the returned guard.
pub fn isolate_root(mut config: EngineConfig) -> anyhow::Result<(EngineConfig, TempDir)> {
    let scratch = tempfile::tempdir().context("Failed to create an empty root directory")?;
    config.root_dir = scratch.path().to_path_buf();
    Ok((config, scratch))
}

/// Bind a short-lived node on `bind`, download `remote_file` from `server`
/// into `local_file`, then stop.
pub async fn fetch(
    config: EngineConfig,
    bind: SocketAddr,
    server: SocketAddr,
    remote_file: &str,
    local_file: &Path,
) -> anyhow::Result<u64> {
    let (config, _scratch) = isolate_root(config)?;

    let endpoint = UdpEndpoint::bind(bind)
        .await
        .with_context(|| format!("Failed to bind UDP endpoint on {}", bind))?;
    let scheduler = Arc::new(TokioScheduler::current()?);
    let engine = TransferEngine::new(config, endpoint, scheduler);
    engine.start()?;

    let result = Client::new(engine.clone(), server).get(remote_file, local_file).await;
    engine.stop();
    result
}
