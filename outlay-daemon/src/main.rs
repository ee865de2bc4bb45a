mod daemon;
mod wayland;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use outlay_common::ipc::socket_path;
use outlay_common::{ErrorReporting, IpcServer, ProcessExecutor};
use tokio::sync::mpsc;

use crate::daemon::{load_profiles, Daemon};
use crate::wayland::OutputClient;

#[derive(Parser, Debug)]
#[command(name = "outlay")]
#[command(about = "outlay (dynamic output configuration daemon)")]
#[command(version)]
struct Args {
    /// Configuration file, defaults to $XDG_CONFIG_HOME/outlay/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting outlay daemon...");

    let profiles = load_profiles(args.config.as_deref()).map_err(|e| {
        log::error!("Configuration error: {}", e.user_friendly_message());
        anyhow::anyhow!("Configuration error: {}", e.user_friendly_message())
    })?;

    let client = OutputClient::connect().map_err(|e| {
        log::error!("Wayland error: {}", e);
        anyhow::anyhow!("Wayland error: {}", e)
    })?;

    let server = IpcServer::new(socket_path().context("Failed to locate the control socket")?);
    let listener = server.bind()?;
    let (requests_tx, mut requests) = mpsc::channel(16);
    tokio::spawn(IpcServer::serve(listener, requests_tx));

    let mut daemon = Daemon::new(client, ProcessExecutor::new(), profiles, args.config);
    let result = daemon.run(&mut requests).await;

    server.remove_socket();
    daemon.stop();

    if let Err(e) = &result {
        log::error!("outlay daemon stopped: {:#}", e);
    }
    result
}
