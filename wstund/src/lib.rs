#[macro_use]
extern crate tracing;

pub mod api;
pub mod config;
pub mod http;
pub mod log;
pub mod lookup;
pub mod registry;
pub mod token;
pub mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderMap;

use crate::config::Conf;
use crate::registry::Registry;

/// State shared by every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new(conf: Arc<Conf>) -> Self {
        let registry = Registry::new(&conf);
        Self { conf, registry }
    }
}

/// Caller address for logging and `/_stats`: the `X-Forwarded-For` value when
/// a proxy in front of us supplies one, the transport peer otherwise.
pub fn caller_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| peer.to_string())
}
