use std::path::PathBuf;
use std::time::Duration;

use super::core::options::{
    DEFAULT_BLOCK_SIZE, DEFAULT_TIMEOUT_SECS, OptionsProtocol, clamp_block_size, clamp_timeout,
};
use super::transport::MIN_PERIOD;

/// Prefix that marks this protocol's datagrams on the shared endpoint
pub const DEFAULT_PREFIX: &[u8] = b"tftp:";

/// Interval of the timeout sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Transfer engine configuration
///
/// # Example
///
/// ```rust
/// use tftpmux::tftp::EngineConfig;
/// use std::path::PathBuf;
/// use std::time::Duration;
///
/// let config = EngineConfig::new(PathBuf::from("/tmp/tftp"))
///     .with_block_size(1024)
///     .with_timeout(Duration::from_secs(3));
/// assert_eq!(config.block_size, 1024);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory that served files and `dir:` resources are resolved against
    pub root_dir: PathBuf,
    /// Datagram prefix registered on the endpoint
    pub prefix: Vec<u8>,
    /// Block size requested for downloads (default 512)
    pub block_size: u16,
    /// Timeout requested for downloads; whole seconds go on the wire
    pub timeout: Duration,
    /// How often idle peers are checked for expiry
    pub sweep_interval: Duration,
    /// Answer rejected or unresolvable requests with an ERROR packet
    /// instead of dropping them silently
    pub reply_to_rejected_requests: bool,
}

impl EngineConfig {
    /// Create a new configuration
    ///
    /// # Arguments
    ///
    /// * `root_dir` - Root directory for served files
    pub fn new(root_dir: PathBuf) -> Self {
        Self {
            root_dir,
            prefix: DEFAULT_PREFIX.to_vec(),
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            reply_to_rejected_requests: false,
        }
    }

    /// Set block size, clamped to the RFC 2348 range
    pub fn with_block_size(mut self, block_size: u16) -> Self {
        self.block_size = clamp_block_size(u64::from(block_size));
        self
    }

    /// Set timeout, clamped to the RFC 2349 range
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = clamp_timeout(timeout.as_secs());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the sweep period; zero is raised to the scheduler minimum
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(MIN_PERIOD);
        self
    }

    pub fn with_reply_to_rejected_requests(mut self, reply: bool) -> Self {
        self.reply_to_rejected_requests = reply;
        self
    }

    /// Options requested by downloads started with this configuration
    pub fn download_options(&self) -> OptionsProtocol {
        OptionsProtocol {
            block_size: self.block_size,
            timeout: self.timeout,
            transfer_size: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()))
    }
}
