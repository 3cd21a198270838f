#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use wstun_task::{spawn_task, ShutdownHandle};
use wstund::config::{write_pid, Args, Conf};
use wstund::registry::IdleReaperTask;
use wstund::{api, log, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _logger_guard = log::init(args.logfile.as_deref(), args.syslog.as_deref()).context("failed to setup logger")?;
    info!(version = env!("CARGO_PKG_VERSION"), "wstund starting");

    let conf = Arc::new(Conf::from_args(&args));

    if let Some(pid_file) = conf.pid_file.as_deref() {
        // The daemon keeps going without its pidfile; supervisors that need
        // one will notice the error in the log.
        if let Err(error) = write_pid(pid_file) {
            error!(%error, "failed to write pidfile");
        }
    }

    let state = AppState::new(Arc::clone(&conf));
    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let reaper = spawn_task(
        IdleReaperTask {
            registry: Arc::clone(&state.registry),
        },
        shutdown_signal,
    );

    let bind_addr = format!("{}:{}", conf.host, conf.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot listen on {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    let router = api::make_router(state);
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("HTTP server error")?;

    shutdown_handle.signal();
    let _ = reaper.join().await;

    Ok(())
}
