use std::io;

use common::{FailureKind, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("transfer i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid transfer header: {0}")]
    InvalidHeader(String),
    #[error(
        "layer {layer} failed integrity check: expected {expected_len} bytes/crc {expected_crc:08x}, got {actual_len} bytes/crc {actual_crc:08x}"
    )]
    Integrity {
        layer: u32,
        expected_len: u64,
        actual_len: u64,
        expected_crc: u32,
        actual_crc: u32,
    },
    #[error("receiver rejected layer {layer}: {reason}")]
    Rejected { layer: u32, reason: String },
    #[error("timed out with {received} layers received (expecting {total:?})")]
    Timeout { received: usize, total: Option<u32> },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer task failed: {0}")]
    Join(String),
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::InvalidHeader(_) | TransferError::Cancelled | TransferError::Join(_) => {
                FailureKind::Fatal
            }
            TransferError::Protocol(e) => e.kind(),
            _ => FailureKind::Retryable,
        }
    }
}
