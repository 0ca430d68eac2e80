mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use log::info;
use migd::config::{Config, load_config};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .target(env_logger::Target::Stdout)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Start { config } => {
            let cfg = match config {
                Some(path) => {
                    let path = path.to_str().context("config path is not valid UTF-8")?;
                    load_config(path)?
                }
                None => Config::default(),
            };
            info!("[migd] starting with {cfg:?}");

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                on_signal.cancel();
            });
            migd::run(cfg, shutdown).await?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("[migd] shutting down");
}
