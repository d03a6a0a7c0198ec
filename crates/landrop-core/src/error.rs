use std::path::PathBuf;
use thiserror::Error;

use crate::batch::BatchId;
use crate::wire::WireError;

/// Everything that can end a transfer early.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("no response to offer")]
    ResponseTimeout,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("peer refused the transfer")]
    PeerRefused,
    #[error("write failed: {0}")]
    IoWrite(#[source] std::io::Error),
    #[error("read failed: {0}")]
    IoRead(#[source] std::io::Error),
    #[error("peer disconnected after {received} of {expected} bytes")]
    PeerDisconnectedEarly { received: u64, expected: u64 },
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
}

impl From<WireError> for TransferError {
    fn from(e: WireError) -> Self {
        TransferError::ProtocolViolation(e.to_string())
    }
}

/// Failures of calls into the session manager.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session manager has stopped")]
    Stopped,
    #[error("unknown or already resolved {0}")]
    UnknownBatch(BatchId),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}
