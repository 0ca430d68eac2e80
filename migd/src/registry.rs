//! In-memory table of registered pods.
//!
//! All reads and writes go through one mutex; every mutation wakes the
//! tasks waiting on [`PodRegistry::wait_for_destination`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use common::{FailureKind, HandshakeMessage, PodRecord};
use log::{debug, info};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pod {0} is not registered")]
    NotFound(String),
    #[error("pod {0} is already migrating")]
    AlreadyMigrating(String),
    #[error("pod {0} is not migrating")]
    NotMigrating(String),
}

impl RegistryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RegistryError::AlreadyMigrating(_) => FailureKind::Retryable,
            RegistryError::NotFound(_) | RegistryError::NotMigrating(_) => FailureKind::Fatal,
        }
    }
}

#[derive(Default)]
pub struct PodRegistry {
    pods: Mutex<HashMap<String, PodRecord>>,
    changed: Notify,
}

impl PodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller side of the registration handshake.
    pub async fn register(&self, msg: HandshakeMessage) -> HandshakeMessage {
        let mut pods = self.pods.lock().await;
        let reply = match pods.get_mut(&msg.pod_name) {
            None => {
                info!(
                    "[registry] new pod {} at {}",
                    msg.pod_name, msg.pod_address
                );
                pods.insert(
                    msg.pod_name.clone(),
                    PodRecord::new(&msg.pod_name, &msg.pod_address),
                );
                HandshakeMessage {
                    is_new: true,
                    is_mig: false,
                    peer_address: None,
                    ..msg
                }
            }
            Some(record) if record.migration => {
                info!(
                    "[registry] {} registered as migration destination at {}",
                    msg.pod_name, msg.pod_address
                );
                record.destination = Some(msg.pod_address.clone());
                record.handshakes += 1;
                HandshakeMessage {
                    is_new: false,
                    is_mig: true,
                    peer_address: None,
                    ..msg
                }
            }
            Some(record) => {
                let previous = std::mem::replace(&mut record.address, msg.pod_address.clone());
                let peer_address = (previous != msg.pod_address).then_some(previous.clone());
                record.registered_at = Utc::now();
                record.handshakes += 1;
                debug!(
                    "[registry] {} re-registered at {} (was {previous})",
                    msg.pod_name, msg.pod_address
                );
                HandshakeMessage {
                    is_new: false,
                    is_mig: false,
                    peer_address,
                    ..msg
                }
            }
        };
        drop(pods);
        self.changed.notify_waiters();
        reply
    }

    pub async fn get(&self, name: &str) -> Option<PodRecord> {
        self.pods.lock().await.get(name).cloned()
    }

    /// Every record, ordered by name.
    pub async fn list(&self) -> Vec<PodRecord> {
        let mut records: Vec<PodRecord> = self.pods.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub async fn remove(&self, name: &str) -> Option<PodRecord> {
        let removed = self.pods.lock().await.remove(name);
        if removed.is_some() {
            self.changed.notify_waiters();
        }
        removed
    }

    /// Flip the migration flag on the stored record and return a snapshot of it.
    pub async fn begin_migration(&self, name: &str) -> Result<PodRecord, RegistryError> {
        let mut pods = self.pods.lock().await;
        let record = pods
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if record.migration {
            return Err(RegistryError::AlreadyMigrating(name.to_string()));
        }
        record.migration = true;
        record.destination = None;
        Ok(record.clone())
    }

    pub async fn destination_of(&self, name: &str) -> Option<String> {
        self.pods
            .lock()
            .await
            .get(name)
            .and_then(|r| r.destination.clone())
    }

    /// Wait until a destination has registered for `name`. `None` on timeout,
    /// cancellation, or when the record disappears.
    pub async fn wait_for_destination(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let pods = self.pods.lock().await;
                match pods.get(name) {
                    Some(record) => {
                        if let Some(dest) = &record.destination {
                            return Some(dest.clone());
                        }
                    }
                    None => return None,
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// Migration succeeded: the pod now lives at `address`.
    pub async fn complete(&self, name: &str, address: &str) -> Result<(), RegistryError> {
        let mut pods = self.pods.lock().await;
        let record = pods
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !record.migration {
            return Err(RegistryError::NotMigrating(name.to_string()));
        }
        record.migration = false;
        record.destination = None;
        record.address = address.to_string();
        drop(pods);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Migration aborted: clear the flag, keep the origin address.
    pub async fn rollback(&self, name: &str) -> Result<(), RegistryError> {
        let mut pods = self.pods.lock().await;
        let record = pods
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        record.migration = false;
        record.destination = None;
        drop(pods);
        self.changed.notify_waiters();
        Ok(())
    }
}
