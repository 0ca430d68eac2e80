//! In-memory stand-ins for the cluster and the agents.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};

use crate::agent::{AgentControl, AgentError};
use crate::cluster::{ClusterApi, ClusterError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    CountPods,
    SetLabel {
        node: String,
        key: String,
        value: Option<String>,
    },
    Scale {
        deployment: String,
        delta: i32,
    },
    DeletePods {
        deployment: String,
        node: String,
    },
}

#[derive(Default)]
struct ClusterState {
    calls: Vec<ClusterCall>,
    labels: HashMap<String, BTreeMap<String, String>>,
    replicas: HashMap<String, i32>,
    pods: usize,
    fail_on: Vec<&'static str>,
}

/// Records every call and keeps labels and replica counts in memory.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_deployment(self, deployment: &str, replicas: i32) -> Self {
        {
            let mut state = self.lock();
            state.replicas.insert(deployment.to_string(), replicas);
            state.pods += replicas as usize;
        }
        self
    }

    pub fn with_label(self, node: &str, key: &str, value: &str) -> Self {
        self.lock()
            .labels
            .entry(node.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Make every call of `op` ("label", "scale", "delete", "count") fail with a 500.
    pub fn fail_on(&self, op: &'static str) {
        self.lock().fail_on.push(op);
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    /// Calls that change cluster state.
    pub fn mutations(&self) -> Vec<ClusterCall> {
        self.calls()
            .into_iter()
            .filter(|c| *c != ClusterCall::CountPods)
            .collect()
    }

    pub fn label(&self, node: &str, key: &str) -> Option<String> {
        self.lock()
            .labels
            .get(node)
            .and_then(|l| l.get(key).cloned())
    }

    pub fn replicas(&self, deployment: &str) -> i32 {
        self.lock().replicas.get(deployment).copied().unwrap_or(0)
    }

    fn record(&self, call: ClusterCall, op: &'static str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.fail_on.contains(&op) {
            return Err(ClusterError::Status {
                method: Method::PATCH,
                url: format!("fake://{op}"),
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn count_pods(&self) -> Result<usize, ClusterError> {
        self.record(ClusterCall::CountPods, "count")?;
        Ok(self.lock().pods)
    }

    async fn set_node_label(
        &self,
        node: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ClusterError> {
        self.record(
            ClusterCall::SetLabel {
                node: node.to_string(),
                key: key.to_string(),
                value: value.map(str::to_string),
            },
            "label",
        )?;
        let mut state = self.lock();
        let labels = state.labels.entry(node.to_string()).or_default();
        match value {
            Some(v) => {
                labels.insert(key.to_string(), v.to_string());
            }
            None => {
                labels.remove(key);
            }
        }
        Ok(())
    }

    async fn scale_deployment(&self, deployment: &str, delta: i32) -> Result<i32, ClusterError> {
        self.record(
            ClusterCall::Scale {
                deployment: deployment.to_string(),
                delta,
            },
            "scale",
        )?;
        let mut state = self.lock();
        let replicas = state.replicas.entry(deployment.to_string()).or_insert(0);
        *replicas = (*replicas + delta).max(0);
        Ok(*replicas)
    }

    async fn delete_pods_on_node(&self, deployment: &str, node: &str) -> Result<(), ClusterError> {
        self.record(
            ClusterCall::DeletePods {
                deployment: deployment.to_string(),
                node: node.to_string(),
            },
            "delete",
        )
    }
}

#[derive(Default)]
struct AgentState {
    pushes: Vec<(String, String)>,
    layers: u32,
    failure: Option<String>,
    offline: bool,
    push_delay: Duration,
}

/// Answers migrate-out requests with a fixed layer count or a scripted failure.
#[derive(Clone, Default)]
pub struct ScriptedAgents {
    state: Arc<Mutex<AgentState>>,
}

impl ScriptedAgents {
    pub fn pushing(layers: u32) -> Self {
        let agents = Self::default();
        agents.lock().layers = layers;
        agents
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_with(&self, reason: &str) {
        self.lock().failure = Some(reason.to_string());
    }

    /// Refuse every connection, as an agent that is not running would.
    pub fn go_offline(&self) {
        self.lock().offline = true;
    }

    /// Hold every migrate-out request for `delay` before answering.
    pub fn delay_pushes(&self, delay: Duration) {
        self.lock().push_delay = delay;
    }

    fn refused(agent: &str) -> AgentError {
        AgentError::Connect {
            addr: agent.to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        }
    }

    /// `(agent, destination)` of every migrate-out request.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.lock().pushes.clone()
    }
}

#[async_trait]
impl AgentControl for ScriptedAgents {
    async fn migrate_out(&self, agent: &str, destination: &str) -> Result<u32, AgentError> {
        let (delay, outcome) = {
            let mut state = self.lock();
            if state.offline {
                return Err(Self::refused(agent));
            }
            state
                .pushes
                .push((agent.to_string(), destination.to_string()));
            let outcome = match &state.failure {
                Some(reason) => Err(AgentError::Failed(reason.clone())),
                None => Ok(state.layers),
            };
            (state.push_delay, outcome)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn status(&self, agent: &str) -> Result<u32, AgentError> {
        let state = self.lock();
        if state.offline {
            return Err(Self::refused(agent));
        }
        Ok(state.layers + 1)
    }
}
