use std::io;
use std::time::Duration;

use async_trait::async_trait;
use common::wire::{read_frame, write_frame};
use common::{AgentCommand, AgentReply, FailureKind, ProtocolError, address_host};
use log::{debug, info};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent at {addr} unreachable: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("agent at {addr} did not answer within {after:?}")]
    Timeout { addr: String, after: Duration },
    #[error("agent reported failure: {0}")]
    Failed(String),
    #[error("unexpected agent reply: {0:?}")]
    Unexpected(AgentReply),
}

impl AgentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::Protocol(e) => e.kind(),
            AgentError::Unexpected(_) => FailureKind::Fatal,
            _ => FailureKind::Retryable,
        }
    }
}

/// How the controller instructs agents.
#[async_trait]
pub trait AgentControl: Send + Sync {
    /// Ask the agent registered at `agent` to push its layers to `destination`.
    /// Returns the number of layers pushed.
    async fn migrate_out(&self, agent: &str, destination: &str) -> Result<u32, AgentError>;

    async fn status(&self, agent: &str) -> Result<u32, AgentError>;
}

/// Reaches agents on their control port over framed TCP.
pub struct TcpAgentControl {
    port: u16,
    connect_timeout: Duration,
}

impl TcpAgentControl {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }

    /// Control endpoint of the agent registered at `agent` (`host[:port]`).
    pub fn control_addr(&self, agent: &str) -> String {
        format!("{}:{}", address_host(agent), self.port)
    }

    async fn call(&self, agent: &str, cmd: AgentCommand) -> Result<AgentReply, AgentError> {
        let addr = self.control_addr(agent);
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(AgentError::Connect { addr, source }),
            Err(_) => {
                return Err(AgentError::Timeout {
                    addr,
                    after: self.connect_timeout,
                });
            }
        };
        debug!("[agent] sending {cmd:?} to {addr}");
        write_frame(&mut stream, &cmd).await?;
        let reply: AgentReply = read_frame(&mut stream).await?;
        debug!("[agent] {addr} replied {reply:?}");
        Ok(reply)
    }
}

#[async_trait]
impl AgentControl for TcpAgentControl {
    async fn migrate_out(&self, agent: &str, destination: &str) -> Result<u32, AgentError> {
        let cmd = AgentCommand::MigrateOut {
            destination: destination.to_string(),
        };
        match self.call(agent, cmd).await? {
            AgentReply::Pushed { layers } => {
                info!("[agent] {agent} pushed {layers} layers to {destination}");
                Ok(layers)
            }
            AgentReply::Failed { reason } => Err(AgentError::Failed(reason)),
            other => Err(AgentError::Unexpected(other)),
        }
    }

    async fn status(&self, agent: &str) -> Result<u32, AgentError> {
        match self.call(agent, AgentCommand::Status).await? {
            AgentReply::Status { level } => Ok(level),
            AgentReply::Failed { reason } => Err(AgentError::Failed(reason)),
            other => Err(AgentError::Unexpected(other)),
        }
    }
}
