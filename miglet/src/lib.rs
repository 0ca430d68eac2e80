//! Per-pod migration agent.
//!
//! On start the agent binds its transfer listener, registers with the
//! controller and, depending on the reply, restores a migrated stack, starts a
//! fresh one, or extends the layers already on this node. It then serves the
//! control port the controller uses to move the pod out.

pub mod agent;
pub mod args;
pub mod control;
pub mod handshake;

use std::sync::Arc;

use anyhow::Context;
use common::HandshakeMessage;
use liblayer::{CommandRunner, LayerLayout, LayerManager};
use libtransfer::Receiver;
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::args::Args;

/// Start the agent with `runner` executing mount commands, and serve the
/// control port until `shutdown` fires.
pub async fn run_with<R: CommandRunner + 'static>(
    args: Args,
    runner: R,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let layout = LayerLayout::new(&args.layer_root, args.base_dir());
    let manager = LayerManager::new(runner, layout, &args.root_dir);
    let agent = Arc::new(
        Agent::new(&args.name, manager, args.transfer_options())
            .capturing_base(args.captures_base()),
    );

    // listening before the handshake so an origin can push as soon as the
    // controller learns about this pod
    let receiver = Receiver::bind(
        &format!("0.0.0.0:{}", args.transfer_port),
        args.layer_root.join("incoming"),
        args.transfer_options(),
    )
    .context("failed to bind transfer listener")?;

    let request = HandshakeMessage::register(&args.name, args.pod_address());
    let reply = handshake::register(&args.controller, &request, args.connect_timeout())
        .await
        .context("failed to register with controller")?;

    let role = agent
        .start(
            &reply,
            Some(receiver),
            args.layer_count,
            args.receive_timeout(),
            shutdown.clone(),
        )
        .await
        .context("agent startup failed")?;
    info!("[miglet] {} running as {role:?}", args.name);

    let control = TcpListener::bind(("0.0.0.0", args.control_port))
        .await
        .with_context(|| format!("failed to bind control port {}", args.control_port))?;
    control::serve(control, agent, args.connect_timeout(), shutdown).await?;
    Ok(())
}
