//! Public HTTP ingress: accepts caller requests, pushes them through the
//! tunnel matching their token, and relays the tunneled response.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use regex::Regex;
use tokio::sync::mpsc;
use tunnel_proto::is_hop_by_hop;

use crate::config::should_strip_base_path;
use crate::http::HttpError;
use crate::token::Token;
use crate::tunnel::{TunnelReply, TunnelRequest};
use crate::{caller_addr, AppState};

/// Total attempts per caller request; attempts after the first happen only
/// on a transport-retry verdict from the tunnel writer.
const MAX_TRIES: usize = 3;

static TOKEN_PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new("^/_token/([^/]+)(/.*)").expect("static regex"));

/// Catch-all entry point: routes token-in-path requests, token-in-header
/// requests, and base-path mismatches.
pub(super) async fn payload_dispatch(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let base = state.conf.base_path.as_str();
    let path = request.uri().path();

    let effective = if should_strip_base_path(path, base) {
        let stripped = &path[base.len()..];
        if stripped.is_empty() {
            "/".to_owned()
        } else {
            stripped.to_owned()
        }
    } else if base.is_empty() || base == "/" {
        path.to_owned()
    } else {
        // Outside the configured base path there is nothing to serve.
        return HttpError::not_found().msg("404 page not found").into_response();
    };

    let target_with_query = match request.uri().query() {
        Some(query) => format!("{effective}?{query}"),
        None => effective.clone(),
    };

    if effective == "/_token" || effective.starts_with("/_token/") {
        let Some(captures) = TOKEN_PATH_RE.captures(&target_with_query) else {
            info!(url = %target_with_query, "missing token or URI");
            return HttpError::bad_request().msg("Missing token in URI").into_response();
        };
        let token = Token::from(&captures[1]);
        let target = captures[2].to_owned();
        if http::Uri::try_from(target.as_str()).is_err() {
            info!(url = %target, "invalid URI format");
            return HttpError::bad_request().msg("Invalid URI format").into_response();
        }
        return payload_handler(state, token, target, peer, request).await;
    }

    let Some(token) = request
        .headers()
        .get("x-token")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(Token::from)
    else {
        info!(url = %target_with_query, "missing X-Token header");
        return HttpError::bad_request().msg("Missing X-Token header").into_response();
    };
    payload_handler(state, token, target_with_query, peer, request).await
}

/// Serializes the caller request, then runs the enqueue/await/relay loop.
async fn payload_handler(state: AppState, token: Token, target: String, peer: SocketAddr, request: Request) -> Response {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let x_host = headers
        .get("x-host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let remote_addr = caller_addr(&headers, peer);

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(error) => {
            return HttpError::bad_request().err()(error).into_response();
        }
    };

    let wire = tunnel_proto::serialize_request(method.as_str(), &target, &headers, &body);
    let deadline = tokio::time::Instant::now() + state.conf.http_timeout;
    let (tunnel_request, mut reply_rx) = TunnelRequest::new(format!("{method} {target}"), remote_addr.clone(), wire, deadline);

    for attempt in 1..=MAX_TRIES {
        match get_response(&state, &token, &tunnel_request, &mut reply_rx, attempt, &x_host).await {
            Outcome::Done(response) => return response,
            Outcome::Retry => {
                info!(token = %token.cut(), verb = %method, url = %target, "retrying over the tunnel");
            }
        }
    }

    HttpError::gateway_timeout()
        .msg("error sending request, please retry")
        .into_response()
}

enum Outcome {
    Done(Response),
    Retry,
}

/// One attempt: enqueue onto whatever tunnel currently serves the token and
/// wait for its verdict. The request is always retired on the way out, so a
/// later reply for its id is recognized as orphaned.
async fn get_response(
    state: &AppState,
    token: &Token,
    request: &Arc<TunnelRequest>,
    reply_rx: &mut mpsc::Receiver<TunnelReply>,
    attempt: usize,
    x_host: &str,
) -> Outcome {
    let Some(rs) = state.registry.get(token, false) else {
        info!(token = %token.cut(), addr = %request.remote_addr, status = 404, "tunnel not found");
        return Outcome::Done(
            HttpError::not_found()
                .msg("Tunnel not found (or not seen in a long time)")
                .into_response(),
        );
    };

    let outcome = attempt_once(&rs, request, reply_rx, attempt, x_host).await;
    rs.retire_request(request);
    outcome
}

async fn attempt_once(
    rs: &Arc<crate::tunnel::RemoteServer>,
    request: &Arc<TunnelRequest>,
    reply_rx: &mut mpsc::Receiver<TunnelReply>,
    attempt: usize,
    x_host: &str,
) -> Outcome {
    if let Err(error) = rs.add_request(request) {
        info!(addr = %request.remote_addr, status = 504, %error, "request refused");
        return Outcome::Done(HttpError::gateway_timeout().msg(error.to_string()).into_response());
    }

    info!(
        req = %request.info,
        addr = %request.remote_addr,
        x_host = %x_host,
        attempt,
        "caller request enqueued"
    );

    let Some(remaining) = request.deadline.checked_duration_since(tokio::time::Instant::now()) else {
        info!(status = 504, "request deadline already expired");
        return Outcome::Done(
            HttpError::gateway_timeout()
                .msg("Request deadline already expired")
                .into_response(),
        );
    };

    match tokio::time::timeout(remaining, reply_rx.recv()).await {
        Ok(Some(TunnelReply::Response(payload))) => {
            let response = relay_response(payload);
            info!(status = response.status().as_u16(), "caller request answered");
            Outcome::Done(response)
        }
        Ok(Some(TunnelReply::Error(crate::tunnel::TunnelError::SendFailed))) => Outcome::Retry,
        Ok(Some(TunnelReply::Error(error))) => {
            info!(status = 504, %error, "caller request failed");
            Outcome::Done(HttpError::gateway_timeout().msg(error.to_string()).into_response())
        }
        // Unreachable while we hold the request (its sender lives inside),
        // but a closed channel must not hang the caller.
        Ok(None) => Outcome::Done(HttpError::gateway_timeout().msg("tunnel closed").into_response()),
        Err(_) => {
            info!(status = 504, "tunnel timeout");
            Outcome::Done(HttpError::gateway_timeout().msg("Tunnel timeout").into_response())
        }
    }
}

/// Turns the raw tunneled response into the caller-facing response: parse,
/// drop hop-by-hop headers, relay status and body. An unparsable response
/// maps to 506.
fn relay_response(payload: Bytes) -> Response {
    let parsed = match tunnel_proto::parse_response(payload) {
        Ok(parsed) => parsed,
        Err(error) => {
            info!(%error, "can't parse tunneled response");
            return variant_also_negotiates();
        }
    };

    let Ok(status) = StatusCode::from_u16(parsed.status) else {
        info!(status = parsed.status, "tunneled response carries an invalid status code");
        return variant_also_negotiates();
    };

    let mut response = Response::builder();
    for (name, value) in parsed.headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        response = response.header(name, value);
    }

    response
        .status(status)
        .body(Body::from(parsed.body))
        .unwrap_or_else(|_| variant_also_negotiates())
}

fn variant_also_negotiates() -> Response {
    let mut response = StatusCode::VARIANT_ALSO_NEGOTIATES.into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
        .headers_mut()
        .insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}
