#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use clap::Parser as _;
use wstunc::config::{write_pid, Args, ClientConfig};
use wstunc::{log, WsTunnelClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _logger_guard = log::init(args.logfile.as_deref()).context("failed to setup logger")?;
    info!(version = env!("CARGO_PKG_VERSION"), "wstunc starting");

    let cfg = ClientConfig::from_args(&args)?;

    if let Some(pid_file) = cfg.pid_file.as_deref() {
        write_pid(pid_file)?;
    }

    let client = WsTunnelClient::new(cfg)?;

    let signal_client = client.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_client.stop();
    });

    client.run().await
}
