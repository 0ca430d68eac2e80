use std::io;
use std::sync::Arc;
use std::time::Duration;

use common::wire::{ProtocolError, read_frame, write_frame};
use common::{AgentCommand, AgentReply};
use liblayer::CommandRunner;
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;

/// Serve controller instructions on the control port until `shutdown` fires.
pub async fn serve<R: CommandRunner + 'static>(
    listener: TcpListener,
    agent: Arc<Agent<R>>,
    frame_timeout: Duration,
    shutdown: CancellationToken,
) -> io::Result<()> {
    info!("[control] listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[control] failed to accept connection: {e}");
                    continue;
                }
            },
        };
        let agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &agent, frame_timeout).await {
                warn!("[control] request from {peer} failed: {e}");
            }
        });
    }
    Ok(())
}

async fn handle_connection<R: CommandRunner + 'static>(
    mut stream: TcpStream,
    agent: &Agent<R>,
    frame_timeout: Duration,
) -> Result<(), ProtocolError> {
    let cmd: AgentCommand = timeout(frame_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no command received"))??;
    let reply = match cmd {
        AgentCommand::MigrateOut { destination } => {
            info!("[control] migrate-out of {} to {destination}", agent.name());
            match agent.migrate_out(&destination).await {
                Ok(layers) => AgentReply::Pushed { layers },
                Err(e) => {
                    error!("[control] migrate-out to {destination} failed: {e}");
                    AgentReply::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        }
        AgentCommand::Status => AgentReply::Status {
            level: agent.level().await,
        },
    };
    write_frame(&mut stream, &reply).await
}
