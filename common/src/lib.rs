pub mod wire;

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use wire::ProtocolError;

/// Port the controller accepts agent registrations on.
pub const DEFAULT_REGISTRATION_PORT: u16 = 3333;
/// Port a destination agent receives layers on.
pub const DEFAULT_TRANSFER_PORT: u16 = 2486;
/// Port an agent accepts migrate-out instructions on.
pub const DEFAULT_CONTROL_PORT: u16 = 2487;

/// Whether a failed boundary operation is worth re-driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Retryable,
    Fatal,
}

/// Exchanged once per agent lifetime on the registration port.
///
/// The request and the reply are the same type and travel with the same
/// encoding in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub pod_name: String,
    pub pod_address: String,
    pub is_new: bool,
    pub is_mig: bool,
    // Only meaningful in replies: the address of an earlier incarnation of the pod.
    #[serde(default)]
    pub peer_address: Option<String>,
}

impl HandshakeMessage {
    /// The request an agent sends when it starts.
    pub fn register(pod_name: impl Into<String>, pod_address: impl Into<String>) -> Self {
        HandshakeMessage {
            pod_name: pod_name.into(),
            pod_address: pod_address.into(),
            is_new: true,
            is_mig: false,
            peer_address: None,
        }
    }
}

/// Controller-side record of one running container instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub name: String,
    /// host:port the pod receives layers on
    pub address: String,
    /// The pod is the target of an in-flight migration.
    pub migration: bool,
    #[serde(default)]
    pub metadata: String,
    /// Transfer address of the incarnation that registered as migration destination.
    #[serde(default)]
    pub destination: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub handshakes: u64,
}

impl PodRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        PodRecord {
            name: name.into(),
            address: address.into(),
            migration: false,
            metadata: String::new(),
            destination: None,
            registered_at: Utc::now(),
            handshakes: 1,
        }
    }
}

/// Instructions the controller sends to an agent's control port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentCommand {
    /// Freeze the current top layer and push every committed layer to `destination`.
    MigrateOut { destination: String },
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentReply {
    Pushed { layers: u32 },
    Status { level: u32 },
    Failed { reason: String },
}

/// Host part of a `host:port` address.
pub fn address_host(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => address,
    }
}

/// `address` as `host:port`, appending `port` only when it names none.
pub fn with_default_port(address: &str, port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match address.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{address}:{port}"),
    }
}
