//! Serving side of the transfer engine
//!
//! - `storage`: Resolves requested names under the root directory
//! - `packer`: Archives directories requested with the `dir:` prefix

mod packer;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::config::EngineConfig;
use super::engine::TransferEngine;
use super::transport::{TokioScheduler, UdpEndpoint};

pub use packer::pack_directory;
pub use storage::{DIR_PREFIX, Storage};

/// Bytes served for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Vec<u8>,
    pub size: u64,
}

impl Payload {
    pub fn new(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self { data, size }
    }
}

/// Serve `config.root_dir` on `bind` until Ctrl+C
pub async fn run(config: EngineConfig, bind: SocketAddr) -> Result<()> {
    log::info!("Starting TFTP node on {}", bind);
    log::info!("Root directory: {}", config.root_dir.display());
    log::info!("Block size: {}, timeout: {:?}", config.block_size, config.timeout);

    let endpoint = UdpEndpoint::bind(bind)
        .await
        .with_context(|| format!("Failed to bind UDP endpoint on {}", bind))?;
    let scheduler = Arc::new(TokioScheduler::current()?);
    let engine = TransferEngine::new(config, endpoint, scheduler);
    engine.start()?;

    log::info!("TFTP node listening, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;

    engine.stop();
    log::info!("TFTP node stopped");
    Ok(())
}
