use std::io;
use std::sync::Arc;
use std::time::Duration;

use common::HandshakeMessage;
use common::wire::{ProtocolError, read_frame, write_frame};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::registry::PodRegistry;

/// Accept agent registrations until `shutdown` fires.
/// Each connection carries one handshake and is served on its own task.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<PodRegistry>,
    frame_timeout: Duration,
    shutdown: CancellationToken,
) -> io::Result<()> {
    info!("[server] registration listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[server] failed to accept connection: {e}");
                    continue;
                }
            },
        };
        debug!("[server] connection accepted: addr={peer}");
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &registry, frame_timeout).await {
                warn!("[server] registration from {peer} failed: {e}");
            }
        });
    }
    info!("[server] registration listener stopped");
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    registry: &PodRegistry,
    frame_timeout: Duration,
) -> Result<(), ProtocolError> {
    let msg: HandshakeMessage = timeout(frame_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no handshake received"))??;
    let reply = registry.register(msg).await;
    write_frame(&mut stream, &reply).await
}
