use serde::{Deserialize, Serialize};

/// First frame of a session: which layer follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    /// 1-based level of the layer carried by this session.
    pub layer: u32,
    /// Number of layers the sender will push in this migration.
    pub total: u32,
    pub origin: String,
}

/// Follows the gzip body; describes the uncompressed changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTrailer {
    pub length: u64,
    pub crc32: u32,
}

/// Receiver's verdict, sent back once the layer is on disk (or discarded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAck {
    pub layer: u32,
    pub accepted: bool,
    pub reason: Option<String>,
}
