//! Configuration file support
//!
//! Every field is optional; command line arguments win over the file, and
//! the file wins over built-in defaults.
//!
//! ```toml
//! [tftp]
//! root_dir = "/srv/tftp"
//! bind = "0.0.0.0:6969"
//! block_size = 1024
//! timeout = "5s"
//! sweep_interval = "2s"
//! prefix = "tftp:"
//! reply_to_rejected_requests = false
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::tftp::EngineConfig;

pub const DEFAULT_BIND: &str = "0.0.0.0:6969";

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub tftp: Option<TftpConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TftpConfig {
    pub root_dir: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub prefix: Option<String>,
    pub block_size: Option<u16>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
    pub reply_to_rejected_requests: Option<bool>,
}

/// Values given on the command line
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub root_dir: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub block_size: Option<u16>,
    pub timeout: Option<Duration>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Build the engine configuration and bind address for this run
    pub fn resolve(&self, cli: &CliOverrides) -> Result<(EngineConfig, SocketAddr)> {
        let file = self.tftp.clone().unwrap_or_default();

        let root_dir = match cli.root_dir.clone().or(file.root_dir) {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };
        let bind = match cli.bind.or(file.bind) {
            Some(bind) => bind,
            None => DEFAULT_BIND.parse()?,
        };

        let mut config = EngineConfig::new(root_dir);
        if let Some(block_size) = cli.block_size.or(file.block_size) {
            config = config.with_block_size(block_size);
        }
        if let Some(timeout) = cli.timeout.or(file.timeout) {
            config = config.with_timeout(timeout);
        }
        if let Some(interval) = file.sweep_interval {
            if interval.is_zero() {
                anyhow::bail!("sweep_interval must be greater than zero");
            }
            config = config.with_sweep_interval(interval);
        }
        if let Some(prefix) = file.prefix {
            if prefix.is_empty() {
                anyhow::bail!("prefix must not be empty");
            }
            config = config.with_prefix(prefix.into_bytes());
        }
        if let Some(reply) = file.reply_to_rejected_requests {
            config = config.with_reply_to_rejected_requests(reply);
        }

        Ok((config, bind))
    }
}
