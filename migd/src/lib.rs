//! Migration controller.
//!
//! Keeps the registry of running pods, answers agent registrations on the
//! registration port, and drives migrations requested over the HTTP API.

pub mod agent;
pub mod api;
pub mod cluster;
pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod server;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

use std::sync::Arc;

use anyhow::Context;
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::agent::TcpAgentControl;
use crate::cluster::{ClusterApi, KubeClient};
use crate::config::Config;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::registry::PodRegistry;

/// Run the registration server and the HTTP API until `shutdown` fires.
pub async fn run(cfg: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let cluster = KubeClient::from_config(&cfg.cluster).context("failed to build cluster client")?;
    match cluster.count_pods().await {
        Ok(n) => info!("[migd] cluster reachable, {n} pods in {}", cfg.cluster.namespace),
        Err(e) => log::warn!("[migd] cluster not reachable yet: {e}"),
    }

    let registry = Arc::new(PodRegistry::new());
    let agents = TcpAgentControl::new(
        cfg.migration.agent_control_port,
        cfg.migration.connect_timeout(),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(cluster),
        Arc::new(agents),
        OrchestratorSettings::from_config(&cfg),
    ));

    let registration = TcpListener::bind(&cfg.registration_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.registration_addr))?;
    let http = TcpListener::bind(&cfg.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http_addr))?;

    let server = tokio::spawn(server::serve(
        registration,
        registry,
        cfg.migration.frame_timeout(),
        shutdown.clone(),
    ));

    info!("[migd] control API listening on {}", http.local_addr()?);
    let stop = shutdown.clone();
    axum::serve(http, api::create_router(orchestrator))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("control API failed")?;

    shutdown.cancel();
    server.await.context("registration server panicked")??;
    Ok(())
}
