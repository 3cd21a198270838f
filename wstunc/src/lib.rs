#[macro_use]
extern crate tracing;

pub mod config;
pub mod connection;
mod dialer;
mod executor;
pub mod log;
mod proxy;
mod status;
mod tls;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use wstun_task::{spawn_task, ShutdownHandle, ShutdownSignal};

pub use tunnel_proto::ParsedRequest;

use crate::config::ClientConfig;
use crate::connection::{ClientStats, ConnectionManager, ConnectionState};
use crate::status::StatusWriterTask;

/// In-process replacement for the back-end server: when installed, every
/// tunneled request is answered by this handler instead of an HTTP call.
#[async_trait]
pub trait LocalHandler: Send + Sync + 'static {
    /// Produces the raw HTTP/1.1 response bytes for one tunneled request.
    async fn handle(&self, request: ParsedRequest) -> Bytes;
}

pub(crate) struct ClientInner {
    pub(crate) cfg: ClientConfig,
    pub(crate) manager: ConnectionManager,
    pub(crate) http: reqwest::Client,
    pub(crate) local_handler: Option<Arc<dyn LocalHandler>>,
    pub(crate) shutdown: ShutdownSignal,
    shutdown_handle: ShutdownHandle,
    pub(crate) drop_conn: Notify,
    stopped: AtomicBool,
}

/// The tunnel client: dials the broker, serves tunneled requests, and
/// reconnects until stopped.
#[derive(Clone)]
pub struct WsTunnelClient {
    inner: Arc<ClientInner>,
}

impl WsTunnelClient {
    pub fn new(cfg: ClientConfig) -> anyhow::Result<Self> {
        Self::build(cfg, None)
    }

    /// A client whose requests are served by an in-process handler; the
    /// configured back-end URL is ignored in that case.
    pub fn with_local_handler(mut cfg: ClientConfig, handler: Arc<dyn LocalHandler>) -> anyhow::Result<Self> {
        cfg.server = None;
        Self::build(cfg, Some(handler))
    }

    fn build(cfg: ClientConfig, local_handler: Option<Arc<dyn LocalHandler>>) -> anyhow::Result<Self> {
        // The workspace mixes rustls consumers; make sure a crypto provider
        // is installed before any TLS configuration is built.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.insecure)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build local HTTP client")?;

        let manager = ConnectionManager::new(cfg.reconnect_delay, cfg.max_retries);
        let (shutdown_handle, shutdown) = ShutdownHandle::new();

        Ok(Self {
            inner: Arc::new(ClientInner {
                cfg,
                manager,
                http,
                local_handler,
                shutdown,
                shutdown_handle,
                drop_conn: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Runs the reconnect loop until [`stop`](Self::stop) is called or the
    /// retry budget is spent.
    ///
    /// A lost connection is re-dialed immediately; only failed dial attempts
    /// consume the retry budget and back off.
    pub async fn run(&self) -> anyhow::Result<()> {
        let inner = &self.inner;

        let _status_task = inner.cfg.status_file.clone().map(|path| {
            spawn_task(
                StatusWriterTask {
                    path,
                    client: Arc::clone(inner),
                },
                inner.shutdown.clone(),
            )
        });

        loop {
            if inner.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }

            inner.manager.set_state(ConnectionState::Connecting);
            info!(tunnel = %inner.cfg.tunnel, "connecting to tunnel server");

            match dialer::connect(&inner.cfg).await {
                Ok(ws) => {
                    inner.manager.record_success();
                    info!("tunnel connected");
                    executor::run_connection(inner, ws).await;
                    inner.manager.set_state(ConnectionState::Disconnected);
                    info!("tunnel connection ended");
                }
                Err(error) => {
                    let text = format!("{error:#}");
                    warn!(error = %text, "connection failed");
                    let Some(delay) = inner.manager.record_failure(&text) else {
                        return Err(error.context("max retries exceeded"));
                    };

                    info!(delay_secs = delay.as_secs_f64(), "retrying connection");
                    let mut shutdown = inner.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => anyhow::bail!("connection attempt cancelled"),
                    }
                }
            }
        }
    }

    /// Ends the reconnect loop and tears down the active connection.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.shutdown_handle.signal();
    }

    /// Drops the current tunnel connection without stopping the client; the
    /// reconnect loop dials again right away. Used by tests exercising the
    /// reconnect path.
    pub fn drop_connection(&self) {
        // notify_one stores a permit, so a drop requested a moment before
        // the reader reaches its select point is not lost.
        self.inner.drop_conn.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.manager.is_connected()
    }

    pub fn stats(&self) -> ClientStats {
        self.inner.manager.stats()
    }

    #[cfg(test)]
    pub(crate) fn into_inner_for_tests(self) -> Arc<ClientInner> {
        self.inner
    }
}
