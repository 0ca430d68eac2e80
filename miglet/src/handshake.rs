use std::io;
use std::time::Duration;

use common::wire::{ProtocolError, read_frame, write_frame};
use common::{FailureKind, HandshakeMessage};
use log::info;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("controller at {addr} unreachable: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("controller at {addr} did not answer within {after:?}")]
    Timeout { addr: String, after: Duration },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HandshakeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HandshakeError::Protocol(e) => e.kind(),
            _ => FailureKind::Retryable,
        }
    }
}

/// Register this pod with the controller and return its reply.
pub async fn register(
    controller: &str,
    msg: &HandshakeMessage,
    wait: Duration,
) -> Result<HandshakeMessage, HandshakeError> {
    let timed_out = || HandshakeError::Timeout {
        addr: controller.to_string(),
        after: wait,
    };
    let mut stream = timeout(wait, TcpStream::connect(controller))
        .await
        .map_err(|_| timed_out())?
        .map_err(|source| HandshakeError::Connect {
            addr: controller.to_string(),
            source,
        })?;
    info!(
        "[handshake] registering {} at {} with {controller}",
        msg.pod_name, msg.pod_address
    );
    write_frame(&mut stream, msg).await?;
    let reply: HandshakeMessage = timeout(wait, read_frame(&mut stream))
        .await
        .map_err(|_| timed_out())??;
    info!(
        "[handshake] controller replied is_new={} is_mig={} peer={:?}",
        reply.is_new, reply.is_mig, reply.peer_address
    );
    Ok(reply)
}
