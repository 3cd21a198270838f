use std::fmt::Write as _;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;

use crate::{caller_addr, AppState};

/// Plain-text `key=value` statistics.
///
/// The per-tunnel block at the bottom is only reported to localhost callers;
/// everyone else gets the aggregate counters.
pub(super) async fn stats_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> String {
    let mut out = String::new();
    let snapshot = state.registry.snapshot();

    let _ = writeln!(out, "tunnels={}", snapshot.len());
    let _ = writeln!(out, "max_requests_per_tunnel={}", state.conf.max_requests_per_tunnel);
    let _ = writeln!(out, "max_clients_per_token={}", state.conf.max_clients_per_token);

    if state.conf.max_clients_per_token > 0 {
        let (counts, total) = state.registry.client_counts();
        for (token, count) in counts {
            let _ = writeln!(out, "token_clients_{}={count}", token.cut());
        }
        let _ = writeln!(out, "total_clients={total}");
    }

    let addr = caller_addr(&headers, peer);
    if !addr.starts_with("127.0.0.1") {
        let _ = writeln!(out, "More stats available when called from localhost...");
        return out;
    }

    let mut req_pending = 0;
    let mut dead_tunnels = 0;
    for (i, rs) in snapshot.iter().enumerate() {
        let _ = writeln!(out, "\ntunnel{i:02}_token={}", rs.token().cut());

        let pending = rs.pending_count();
        req_pending += pending;
        let _ = writeln!(out, "tunnel{i:02}_req_pending={pending}");

        let info = rs.remote_info();
        let _ = writeln!(out, "tunnel{i:02}_tun_addr={}", info.remote_addr);
        if !info.remote_name.is_empty() {
            let _ = writeln!(out, "tunnel{i:02}_tun_dns={}", info.remote_name);
        }
        if !info.remote_whois.is_empty() {
            let _ = writeln!(out, "tunnel{i:02}_tun_whois={}", info.remote_whois);
        }
        if !info.client_version.is_empty() {
            let _ = writeln!(out, "tunnel{i:02}_client_version={}", info.client_version);
        }

        match rs.idle_duration() {
            None => {
                let _ = writeln!(out, "tunnel{i:02}_idle_secs=NaN");
                dead_tunnels += 1;
            }
            Some(idle) => {
                let _ = writeln!(out, "tunnel{i:02}_idle_secs={:.1}", idle.as_secs_f64());
                if idle > Duration::from_secs(60) {
                    dead_tunnels += 1;
                }
            }
        }

        if let Some(cli_addr) = rs.last_request_addr() {
            let _ = writeln!(out, "tunnel{i:02}_cli_addr={cli_addr}");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "req_pending={req_pending}");
    let _ = writeln!(out, "dead_tunnels={dead_tunnels}");
    out
}
