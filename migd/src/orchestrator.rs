//! Sequences the cluster mutations of a migration around the layer transfer.
//!
//! A migration runs its steps in a fixed order and stops at the first
//! failure. Every completed step that changed cluster state is then undone in
//! reverse order and the pod's migration flag is cleared, so a failed
//! migration leaves the origin pod running and schedulable.
//!
//! Each migration runs on its own task. A caller that stops waiting for it
//! does not stop it; only [`Orchestrator::cancel_migration`] does.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{FailureKind, HandshakeMessage, with_default_port};
use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentControl, AgentError};
use crate::cluster::{ClusterApi, ClusterError};
use crate::config::Config;
use crate::registry::{PodRegistry, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    CheckOrigin,
    RemoveOriginLabel,
    AddDestinationLabel,
    ScaleUp,
    AwaitDestination,
    PushLayers,
    DeleteOriginPod,
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStep::CheckOrigin => "check origin agent",
            MigrationStep::RemoveOriginLabel => "remove origin label",
            MigrationStep::AddDestinationLabel => "add destination label",
            MigrationStep::ScaleUp => "scale up",
            MigrationStep::AwaitDestination => "await destination",
            MigrationStep::PushLayers => "push layers",
            MigrationStep::DeleteOriginPod => "delete origin pod",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::Cluster(e) => e.kind(),
            StepError::Agent(e) => e.kind(),
            StepError::Timeout(_) => FailureKind::Retryable,
            StepError::Cancelled => FailureKind::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid migration request: {0}")]
    Invalid(String),
    #[error("pod {0} is not registered")]
    NotFound(String),
    #[error("pod {0} is already migrating")]
    Conflict(String),
    #[error("migration task of {deployment} ended abnormally: {reason}")]
    Aborted { deployment: String, reason: String },
    #[error("migration failed at step '{step}': {source}")]
    Step {
        step: MigrationStep,
        /// Steps that had completed (and were compensated) before the failure.
        completed: Vec<MigrationStep>,
        #[source]
        source: StepError,
    },
}

impl MigrationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MigrationError::Conflict(_) => FailureKind::Retryable,
            MigrationError::Invalid(_)
            | MigrationError::NotFound(_)
            | MigrationError::Aborted { .. } => FailureKind::Fatal,
            MigrationError::Step { source, .. } => source.kind(),
        }
    }
}

impl From<RegistryError> for MigrationError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(name) => MigrationError::NotFound(name),
            RegistryError::AlreadyMigrating(name) => MigrationError::Conflict(name),
            RegistryError::NotMigrating(name) => {
                MigrationError::Invalid(format!("pod {name} is not migrating"))
            }
        }
    }
}

/// What to migrate and where; validated before anything is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationIntent {
    pub deployment: String,
    pub label: String,
    pub origin_node: String,
    pub dest_node: String,
}

impl MigrationIntent {
    /// Split the label into `(key, value)` after checking every field is set.
    pub fn validate(&self) -> Result<(&str, &str), MigrationError> {
        let fields = [
            ("deployment", &self.deployment),
            ("label", &self.label),
            ("origin node", &self.origin_node),
            ("destination node", &self.dest_node),
        ];
        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(MigrationError::Invalid(format!(
                "missing parameters: {}",
                missing.join(", ")
            )));
        }
        match self.label.split(':').collect::<Vec<_>>().as_slice() {
            [key, value] if !key.is_empty() && !value.is_empty() => Ok((*key, *value)),
            _ => Err(MigrationError::Invalid(format!(
                "incorrect label format {:?}, expected key:value",
                self.label
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub deployment: String,
    pub origin_node: String,
    pub dest_node: String,
    /// Transfer address of the destination agent.
    pub destination: String,
    pub layers: u32,
    pub replicas: i32,
    pub steps: Vec<MigrationStep>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub label: String,
    /// Used when a destination registers an address without a port.
    pub transfer_port: u16,
    pub registration_timeout: Duration,
    pub push_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            label: cfg.label.clone(),
            transfer_port: cfg.migration.transfer_port,
            registration_timeout: cfg.migration.registration_timeout(),
            push_timeout: cfg.migration.push_timeout(),
        }
    }
}

pub struct Orchestrator {
    registry: Arc<PodRegistry>,
    cluster: Arc<dyn ClusterApi>,
    agents: Arc<dyn AgentControl>,
    settings: OrchestratorSettings,
    running: Mutex<HashMap<String, CancellationToken>>,
}

/// Progress of one migration, carried through the steps.
struct Run<'a> {
    intent: &'a MigrationIntent,
    key: &'a str,
    value: &'a str,
    completed: Vec<MigrationStep>,
    replicas: i32,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<PodRegistry>,
        cluster: Arc<dyn ClusterApi>,
        agents: Arc<dyn AgentControl>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            cluster,
            agents,
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PodRegistry> {
        &self.registry
    }

    pub async fn register_pod(&self, msg: HandshakeMessage) -> HandshakeMessage {
        self.registry.register(msg).await
    }

    /// Abort the running migration of `deployment`. Returns false when none is running.
    pub async fn cancel_migration(&self, deployment: &str) -> bool {
        match self.running.lock().await.get(deployment) {
            Some(token) => {
                info!("[orchestrator] cancelling migration of {deployment}");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Migrate `deployment` from `origin_node` to `dest_node` and wait for the outcome.
    ///
    /// The work happens on a spawned task, so dropping the returned future
    /// leaves the migration running to completion or compensation.
    pub async fn migrate_pod(
        self: &Arc<Self>,
        deployment: &str,
        origin_node: &str,
        dest_node: &str,
    ) -> Result<MigrationReport, MigrationError> {
        let intent = MigrationIntent {
            deployment: deployment.to_string(),
            label: self.settings.label.clone(),
            origin_node: origin_node.to_string(),
            dest_node: dest_node.to_string(),
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(intent).await })
            .await
            .map_err(|e| MigrationError::Aborted {
                deployment: deployment.to_string(),
                reason: e.to_string(),
            })?
    }

    async fn drive(&self, intent: MigrationIntent) -> Result<MigrationReport, MigrationError> {
        let (key, value) = intent.validate()?;
        let (deployment, origin_node, dest_node) =
            (&intent.deployment, &intent.origin_node, &intent.dest_node);
        let origin = self.registry.begin_migration(deployment).await?;
        info!(
            "[orchestrator] migrating {deployment} from {origin_node} to {dest_node} (origin agent {})",
            origin.address
        );

        let cancel = CancellationToken::new();
        self.running
            .lock()
            .await
            .insert(deployment.to_string(), cancel.clone());

        let mut run = Run {
            intent: &intent,
            key,
            value,
            completed: Vec::new(),
            replicas: 0,
        };
        let result = self.run_steps(&mut run, &origin.address, &cancel).await;
        self.running.lock().await.remove(deployment);

        match result {
            Ok((destination, layers)) => {
                self.registry.complete(deployment, &destination).await?;
                info!(
                    "[orchestrator] {deployment} migrated to {dest_node} ({layers} layers)"
                );
                Ok(MigrationReport {
                    deployment: intent.deployment.clone(),
                    origin_node: intent.origin_node.clone(),
                    dest_node: intent.dest_node.clone(),
                    destination,
                    layers,
                    replicas: run.replicas,
                    steps: run.completed,
                })
            }
            Err((step, source)) => {
                error!("[orchestrator] migration of {deployment} failed at {step}: {source}");
                self.compensate(&run).await;
                if let Err(e) = self.registry.rollback(deployment).await {
                    warn!("[orchestrator] could not clear migration flag: {e}");
                }
                Err(MigrationError::Step {
                    step,
                    completed: run.completed,
                    source,
                })
            }
        }
    }

    async fn run_steps(
        &self,
        run: &mut Run<'_>,
        origin_address: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, u32), (MigrationStep, StepError)> {
        let (intent, key, value) = (run.intent, run.key, run.value);

        step(run, MigrationStep::CheckOrigin, cancel, async {
            let level = self
                .agents
                .status(origin_address)
                .await
                .map_err(StepError::from)?;
            info!("[orchestrator] origin agent {origin_address} is at level {level}");
            Ok(level)
        })
        .await?;

        step(run, MigrationStep::RemoveOriginLabel, cancel, async {
            self.cluster
                .set_node_label(&intent.origin_node, key, None)
                .await
                .map_err(StepError::from)
        })
        .await?;

        step(run, MigrationStep::AddDestinationLabel, cancel, async {
            self.cluster
                .set_node_label(&intent.dest_node, key, Some(value))
                .await
                .map_err(StepError::from)
        })
        .await?;

        run.replicas = step(run, MigrationStep::ScaleUp, cancel, async {
            self.cluster
                .scale_deployment(&intent.deployment, 1)
                .await
                .map_err(StepError::from)
        })
        .await?;

        let wait = self.settings.registration_timeout;
        let registered = step(run, MigrationStep::AwaitDestination, cancel, async {
            self.registry
                .wait_for_destination(&intent.deployment, wait, cancel)
                .await
                .ok_or(StepError::Timeout(wait))
        })
        .await?;
        let destination = with_default_port(&registered, self.settings.transfer_port);

        let push = self.settings.push_timeout;
        let layers = step(run, MigrationStep::PushLayers, cancel, async {
            match tokio::time::timeout(
                push,
                self.agents.migrate_out(origin_address, &destination),
            )
            .await
            {
                Ok(pushed) => pushed.map_err(StepError::from),
                Err(_) => Err(StepError::Timeout(push)),
            }
        })
        .await?;

        step(run, MigrationStep::DeleteOriginPod, cancel, async {
            self.cluster
                .delete_pods_on_node(&intent.deployment, &intent.origin_node)
                .await
                .map_err(StepError::from)
        })
        .await?;

        Ok((destination, layers))
    }

    /// Undo completed steps, newest first. Failures are logged and skipped.
    async fn compensate(&self, run: &Run<'_>) {
        let intent = run.intent;
        for done in run.completed.iter().rev() {
            let undone = match done {
                MigrationStep::ScaleUp => self
                    .cluster
                    .scale_deployment(&intent.deployment, -1)
                    .await
                    .map(|_| ()),
                MigrationStep::AddDestinationLabel => {
                    self.cluster
                        .set_node_label(&intent.dest_node, run.key, None)
                        .await
                }
                MigrationStep::RemoveOriginLabel => {
                    self.cluster
                        .set_node_label(&intent.origin_node, run.key, Some(run.value))
                        .await
                }
                MigrationStep::CheckOrigin
                | MigrationStep::AwaitDestination
                | MigrationStep::PushLayers
                | MigrationStep::DeleteOriginPod => continue,
            };
            match undone {
                Ok(()) => info!("[orchestrator] compensated {done}"),
                Err(e) => warn!("[orchestrator] failed to compensate {done}: {e}"),
            }
        }
    }
}

/// Run one step unless the migration is cancelled first; record it on success.
async fn step<T>(
    run: &mut Run<'_>,
    which: MigrationStep,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, StepError>>,
) -> Result<T, (MigrationStep, StepError)> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        r = fut => r,
    };
    match result {
        Ok(v) => {
            run.completed.push(which);
            Ok(v)
        }
        Err(e) => Err((which, e)),
    }
}
