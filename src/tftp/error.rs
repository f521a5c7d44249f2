use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::core::ErrorCode;

/// Why a requested resource could not be loaded
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no such file or directory: {}", .0.display())]
    ResourceNotFound(PathBuf),
    #[error("not a file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("path escapes the root directory: {0}")]
    PathTraversal(String),
    #[error("refusing to archive the root directory: {0}")]
    RootArchive(String),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResolveError {
    /// Code reported to the requester when rejections are answered
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ResourceNotFound(_) => ErrorCode::FileNotFound,
            Self::PathTraversal(_) | Self::RootArchive(_) => ErrorCode::AccessViolation,
            Self::NotAFile(_) | Self::NotADirectory(_) => ErrorCode::IllegalOperation,
            Self::Io { .. } => ErrorCode::NotDefined,
        }
    }
}

/// Why a session ended in the failed state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// The peer broke the exchange; an ERROR carrying `code` was sent back
    #[error("protocol violation: {detail}")]
    ProtocolViolation { code: ErrorCode, detail: String },
    /// Nothing heard from the peer within the negotiated timeout
    #[error("timed out waiting for the peer")]
    PeerTimeout,
    /// The peer sent an ERROR packet
    #[error("peer reported error {}: {msg}", .code.as_u16())]
    RemoteError { code: ErrorCode, msg: String },
    /// The request could not be put on the wire
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The endpoint refused to send a packet
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The engine was stopped before the transfer could start
    #[error("transfer engine is stopped")]
    Stopped,
}

/// Delivered to a download's failure callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("download of '{file_name}' failed: {reason}")]
pub struct TransferFailure {
    pub file_name: String,
    pub reason: FailureReason,
    /// Whatever had been received before the failure
    pub partial_data: Vec<u8>,
}
