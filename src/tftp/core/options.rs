//! TFTP option extensions (RFC 2347, RFC 2348, RFC 2349)

use std::fmt;
use std::time::Duration;

/// Default block size (RFC 1350)
pub const DEFAULT_BLOCK_SIZE: u16 = 512;
/// Minimum negotiable block size (RFC 2348)
pub const MIN_BLOCK_SIZE: u16 = 8;
/// Maximum negotiable block size (RFC 2348)
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Default per-session timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Minimum negotiable timeout in seconds (RFC 2349)
pub const MIN_TIMEOUT_SECS: u64 = 1;
/// Maximum negotiable timeout in seconds (RFC 2349)
pub const MAX_TIMEOUT_SECS: u64 = 255;

/// Options understood by this implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionType {
    /// `blksize`: payload bytes per DATA packet
    BlockSize,
    /// `timeout`: seconds of silence before the transfer is abandoned
    Timeout,
    /// `tsize`: total transfer size, supplied by the sender
    TransferSize,
}

impl OptionType {
    /// Wire name of the option
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockSize => "blksize",
            Self::Timeout => "timeout",
            Self::TransferSize => "tsize",
        }
    }

    /// Look up an option by wire name, ignoring ASCII case
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "blksize" => Some(Self::BlockSize),
            "timeout" => Some(Self::Timeout),
            "tsize" => Some(Self::TransferSize),
            _ => None,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single option name/value pair carried by RRQ, WRQ or OACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOption {
    pub option: OptionType,
    pub value: u64,
}

impl TransferOption {
    pub fn new(option: OptionType, value: u64) -> Self {
        Self { option, value }
    }
}

/// Find the value of `option` in an option list
pub fn find_option(options: &[TransferOption], option: OptionType) -> Option<u64> {
    options.iter().find(|o| o.option == option).map(|o| o.value)
}

/// Negotiated parameters of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionsProtocol {
    pub block_size: u16,
    pub timeout: Duration,
    pub transfer_size: Option<u64>,
}

impl Default for OptionsProtocol {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            transfer_size: None,
        }
    }
}

impl OptionsProtocol {
    /// Build the parameters a server grants for a request.
    ///
    /// Returns `None` when the request lacks `blksize` or `timeout`.
    /// Out-of-range values are clamped into the RFC bounds.
    pub fn from_request(options: &[TransferOption]) -> Option<Self> {
        let block_size = find_option(options, OptionType::BlockSize)?;
        let timeout = find_option(options, OptionType::Timeout)?;

        Some(Self {
            block_size: clamp_block_size(block_size),
            timeout: clamp_timeout(timeout),
            transfer_size: None,
        })
    }

    /// Options sent in a read request
    pub fn request_options(&self) -> Vec<TransferOption> {
        vec![
            TransferOption::new(OptionType::BlockSize, u64::from(self.block_size)),
            TransferOption::new(OptionType::Timeout, self.timeout.as_secs()),
        ]
    }

    /// Options sent in an OACK
    pub fn oack_options(&self) -> Vec<TransferOption> {
        let mut options = self.request_options();
        if let Some(size) = self.transfer_size {
            options.push(TransferOption::new(OptionType::TransferSize, size));
        }
        options
    }
}

/// Clamp a requested block size into `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]`
pub fn clamp_block_size(value: u64) -> u16 {
    let clamped = value.clamp(u64::from(MIN_BLOCK_SIZE), u64::from(MAX_BLOCK_SIZE));
    u16::try_from(clamped).unwrap_or(MAX_BLOCK_SIZE)
}

/// Clamp a requested timeout into `[MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS]`
pub fn clamp_timeout(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS))
}
