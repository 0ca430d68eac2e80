//! Point-to-point transfer of archived layers between nodes.
//!
//! A session carries one layer: a header frame, the archive as a single gzip
//! member, a trailer frame with the uncompressed length and CRC32, then an ack
//! frame from the receiver. Frames use the length-prefixed bincode encoding
//! from `common::wire`.

use std::time::Duration;

pub mod error;
pub mod frame;
pub mod receiver;
pub mod sender;

pub use error::TransferError;
pub use frame::{TransferAck, TransferHeader, TransferTrailer};
pub use receiver::{ReceivedLayer, Receiver};
pub use sender::{SendReport, send_file_blocking, send_layer};

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub connect_timeout: Duration,
    /// Per-read/per-write socket timeout.
    pub io_timeout: Duration,
    pub dial_attempts: u32,
    /// Multiplied by the attempt number between dials.
    pub retry_backoff: Duration,
    /// gzip level, 0-9.
    pub compression_level: u32,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            dial_attempts: 5,
            retry_backoff: Duration::from_secs(1),
            compression_level: 7,
        }
    }
}
