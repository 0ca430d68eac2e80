//! The agent side of a migration: what a pod's layer stack does at startup
//! and when the controller asks it to move out.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{FailureKind, HandshakeMessage};
use liblayer::{CommandRunner, LayerError, LayerManager};
use libtransfer::{Receiver, TransferError, TransferHeader, TransferOptions, send_file_blocking};
use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("controller marked this pod as a migration destination but no receiver is bound")]
    NoReceiver,
    #[error("layer task failed: {0}")]
    Join(String),
}

impl AgentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::Layer(e) => e.kind(),
            AgentError::Transfer(e) => e.kind(),
            AgentError::NoReceiver | AgentError::Join(_) => FailureKind::Fatal,
        }
    }
}

/// Which startup path the agent took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// First incarnation: a fresh writable level over the image.
    Fresh { level: u32 },
    /// Destination of a migration: received layers restored under a new level.
    Destination { layers: u32, level: u32 },
    /// Restart on a node that already holds layers. `failed` counts the
    /// levels that could not be delivered to the earlier incarnation.
    Extension { level: u32, pushed: u32, failed: u32 },
}

pub struct Agent<R> {
    name: String,
    layers: Arc<Mutex<LayerManager<R>>>,
    transfer: TransferOptions,
    /// Exported archives are staged here before they are sent.
    staging: PathBuf,
    capture_base: bool,
}

impl<R: CommandRunner + 'static> Agent<R> {
    pub fn new(
        name: impl Into<String>,
        manager: LayerManager<R>,
        transfer: TransferOptions,
    ) -> Self {
        let staging = manager.layout().root().join("outgoing");
        Self {
            name: name.into(),
            layers: Arc::new(Mutex::new(manager)),
            transfer,
            staging,
            capture_base: false,
        }
    }

    /// Capture the container root as the stack's base before the first level.
    pub fn capturing_base(mut self, capture: bool) -> Self {
        self.capture_base = capture;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current level, 0 before `init`.
    pub async fn level(&self) -> u32 {
        self.layers.lock().await.level().unwrap_or(0)
    }

    /// Run `f` on the layer manager on a blocking thread, holding the lock.
    async fn with_layers<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&mut LayerManager<R>) -> Result<T, AgentError> + Send + 'static,
    {
        let mut guard = self.layers.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut guard))
            .await
            .map_err(|e| AgentError::Join(e.to_string()))?
    }

    /// Branch on the controller's handshake reply.
    ///
    /// `receiver` must already be listening when the handshake was sent; it
    /// is only used on the destination path and dropped otherwise.
    pub async fn start(
        &self,
        reply: &HandshakeMessage,
        receiver: Option<Receiver>,
        layer_count: u32,
        receive_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Role, AgentError> {
        if self.capture_base {
            self.with_layers(|m| Ok(m.capture_base()?)).await?;
        }
        if reply.is_mig {
            let receiver = receiver.ok_or(AgentError::NoReceiver)?;
            return self.start_destination(receiver, receive_timeout, cancel).await;
        }
        drop(receiver);

        if reply.is_new {
            let level = self
                .with_layers(|m| {
                    m.init()?;
                    Ok(m.bind_root()?)
                })
                .await?;
            info!("[agent] {} started fresh at level {level}", self.name);
            return Ok(Role::Fresh { level });
        }

        self.start_extension(reply.peer_address.clone(), layer_count)
            .await
    }

    async fn start_destination(
        &self,
        receiver: Receiver,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<Role, AgentError> {
        let incoming = receiver.dir().to_path_buf();
        info!(
            "[agent] {} is a migration destination, waiting for layers",
            self.name
        );
        let received = receiver.receive_layers(deadline, cancel).await?;
        let layers = received.len() as u32;

        let level = self
            .with_layers(move |m| {
                // only the received layers may end up under the new level
                m.clear_levels()?;
                for layer in &received {
                    m.import_layer(layer.layer, &layer.path)?;
                }
                let found = m.layout().discover()?.len() as u32;
                if found != layers {
                    return Err(LayerError::OutOfSync {
                        expected: layers,
                        found,
                    }
                    .into());
                }
                m.init()?;
                let level = m.bind_root()?;
                if let Err(e) = fs::remove_dir_all(&incoming) {
                    warn!("[agent] could not clean {}: {e}", incoming.display());
                }
                Ok(level)
            })
            .await?;
        info!(
            "[agent] {} restored {layers} layers, running at level {level}",
            self.name
        );
        Ok(Role::Destination { layers, level })
    }

    /// Add `count` levels over the existing stack, pushing every frozen level
    /// to `peer` when one is known.
    ///
    /// A failed push does not stop the extension: the remaining levels are
    /// counted as failed and the agent keeps running on the extended stack.
    async fn start_extension(&self, peer: Option<String>, count: u32) -> Result<Role, AgentError> {
        let name = self.name.clone();
        let staging = self.staging.clone();
        let opts = self.transfer.clone();
        let (level, pushed, failed) = self
            .with_layers(move |m| {
                let root_layer = m.layout().discover()?.len() as u32;
                m.init()?;
                let total = root_layer + count;
                let (mut pushed, mut failed) = (0, 0);
                let mut gave_up = false;
                let mut push = |m: &LayerManager<R>, level: u32| {
                    let Some(peer) = &peer else {
                        return;
                    };
                    if gave_up {
                        failed += 1;
                        return;
                    }
                    match push_level(m, peer, &name, &staging, level, total, &opts) {
                        Ok(()) => pushed += 1,
                        Err(e) => {
                            warn!("[agent] pushing level {level} to {peer} failed: {e}");
                            failed += 1;
                            gave_up = true;
                        }
                    }
                };

                for level in 1..=root_layer {
                    push(m, level);
                }
                for _ in 0..count {
                    let level = m.create_layer()?;
                    push(m, level - 1);
                }
                let level = m.bind_root()?;
                Ok((level, pushed, failed))
            })
            .await?;
        info!(
            "[agent] {} extended stack to level {level}, pushed {pushed} layers, {failed} failed",
            self.name
        );
        Ok(Role::Extension {
            level,
            pushed,
            failed,
        })
    }

    /// Freeze the current level and push every committed level to `destination`.
    /// Returns the number of layers pushed.
    pub async fn migrate_out(&self, destination: &str) -> Result<u32, AgentError> {
        let destination = destination.to_string();
        let name = self.name.clone();
        let staging = self.staging.clone();
        let opts = self.transfer.clone();
        let pushed = self
            .with_layers(move |m| {
                let frozen = m.create_layer()? - 1;
                info!("[agent] pushing levels 1..={frozen} to {destination}");
                for level in 1..=frozen {
                    push_level(m, &destination, &name, &staging, level, frozen, &opts)?;
                }
                Ok(frozen)
            })
            .await?;
        Ok(pushed)
    }
}

fn push_level<R: CommandRunner>(
    manager: &LayerManager<R>,
    dest: &str,
    origin: &str,
    staging: &std::path::Path,
    level: u32,
    total: u32,
    opts: &TransferOptions,
) -> Result<(), AgentError> {
    let archive = staging.join(format!("layer-{level}.tar"));
    manager.export_layer(level, &archive)?;
    let header = TransferHeader {
        layer: level,
        total,
        origin: origin.to_string(),
    };
    let sent = send_file_blocking(dest, &archive, &header, opts);
    if let Err(e) = fs::remove_file(&archive) {
        warn!("[agent] could not remove {}: {e}", archive.display());
    }
    sent?;
    Ok(())
}
