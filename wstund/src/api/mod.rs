pub mod health;
pub mod ingress;
pub mod stats;
pub mod ws;

use axum::routing::{any, get};
use axum::Router;

use crate::config::build_path;
use crate::AppState;

/// Builds the full HTTP surface, mounted under the configured base path.
///
/// Everything that is not one of the fixed control paths falls through to
/// the ingress dispatcher, which handles both `/_token/<token>/<rest>` and
/// `X-Token`-addressed forwarding (stripping the base path itself).
pub fn make_router(state: AppState) -> Router {
    let base = state.conf.base_path.as_str();

    Router::new()
        .route(&build_path(base, "/_tunnel"), any(ws::tunnel_handler))
        .route(&build_path(base, "/_health_check"), get(health::health_check))
        .route(&build_path(base, "/_stats"), get(stats::stats_handler))
        .fallback(ingress::payload_dispatch)
        .with_state(state)
}
