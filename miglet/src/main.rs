use clap::Parser;
use liblayer::SystemRunner;
use log::{error, info};
use miglet::args::Args;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .target(env_logger::Target::Stdout)
        .init();

    let args = Args::parse();
    info!("[miglet] starting {} with {args:?}", args.name);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            return;
        }
        info!("[miglet] shutting down");
        on_signal.cancel();
    });

    miglet::run_with(args, SystemRunner, shutdown).await
}
