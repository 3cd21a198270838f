//! Tunnel establishment: websocket upgrade admission and the per-attachment
//! reader / writer / ping-supervisor loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::header::{AUTHORIZATION, ORIGIN, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use subtle::ConstantTimeEq as _;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tunnel_proto::{decode_frame, encode_frame, RequestId};
use wstun_task::ChildTask;

use crate::http::HttpError;
use crate::registry::ClientSlot;
use crate::token::{Token, MIN_TOKEN_LEN};
use crate::tunnel::{RemoteServer, TunnelError, TunnelReply};
use crate::{caller_addr, lookup, AppState};

const WS_WRITE_BUFFER_SIZE: usize = 100 * 1024;

/// Grace between the close control frame and tearing the socket down after a
/// ping timeout.
const PING_TIMEOUT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Grace after a failed tunnel write, letting the close frame flush.
const WRITE_ERROR_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Control messages feeding the writer loop, which owns the socket sink.
enum Ctrl {
    ReaderExited,
    PingTimeout,
}

/// `GET /_tunnel` with a websocket handshake. Admission happens strictly in
/// this order: method, token presence/length, password, client cap, upgrade.
pub(super) async fn tunnel_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let addr = caller_addr(&headers, peer);

    if method != Method::GET {
        return HttpError::bad_request().msg("Only GET requests are supported").into_response();
    }

    let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty()) else {
        info!(%addr, "tunnel request without a token");
        return HttpError::bad_request()
            .msg("Origin header with rendez-vous token required")
            .into_response();
    };
    if origin.len() < MIN_TOKEN_LEN {
        info!(%addr, "tunnel request with a short token");
        return HttpError::bad_request()
            .msg(format!(
                "Rendez-vous token ({origin}) is too short (must be {MIN_TOKEN_LEN} chars)"
            ))
            .into_response();
    }
    let token = Token::from(origin);

    if let Some(expected_password) = state.registry.password_for(&token) {
        if let Err(reason) = check_basic_auth(&headers, &token, expected_password) {
            info!(token = %token.cut(), %addr, reason, "tunnel authentication failed");
            return unauthorized(reason);
        }
        info!(token = %token.cut(), "token authenticated with password");
    } else {
        info!(token = %token.cut(), "token authenticated without password");
    }

    let slot = match state.registry.try_reserve_client(&token) {
        Ok(slot) => slot,
        Err(cap) => {
            info!(token = %token.cut(), %addr, "tunnel connection rejected, client cap reached");
            return HttpError::too_many_requests().msg(cap.to_string()).into_response();
        }
    };

    let Some(ws) = ws else {
        // The reserved slot rolls back via the guard drop.
        info!(token = %token.cut(), %addr, "tunnel connection rejected, not a websocket handshake");
        return HttpError::bad_request().msg("Not a websocket handshake").into_response();
    };

    let client_version = headers
        .get("x-client-version")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    ws.write_buffer_size(WS_WRITE_BUFFER_SIZE)
        .on_upgrade(move |socket| handle_tunnel(state, socket, token, addr, client_version, slot))
        .into_response()
}

async fn handle_tunnel(
    state: AppState,
    socket: WebSocket,
    token: Token,
    addr: String,
    client_version: String,
    slot: Option<ClientSlot>,
) {
    // Short id correlating the log lines of one attachment.
    let conn = uuid::Uuid::new_v4().simple().to_string()[..8].to_owned();

    let rs = state.registry.get_or_create(&token);
    rs.touch();
    rs.set_attachment_info(addr.clone(), client_version.clone());
    info!(token = %token.cut(), %addr, %conn, client_version = %client_version, "new tunnel connection");

    ChildTask::spawn(lookup::enrich(
        Arc::clone(&rs),
        addr.clone(),
        state.conf.robowhois_token.clone(),
    ))
    .detach();

    let ws_timeout = state.conf.ws_timeout;
    let ping_deadline = Arc::new(Mutex::new(Instant::now() + ws_timeout));
    let (ctrl_tx, ctrl_rx) = mpsc::channel(2);

    let (sink, stream) = socket.split();
    let reader = ChildTask::spawn(reader_loop(
        Arc::clone(&rs),
        stream,
        Arc::clone(&ping_deadline),
        ws_timeout,
        ctrl_tx.clone(),
        conn.clone(),
    ));
    let supervisor = ChildTask::spawn(ping_supervisor(ping_deadline, ctrl_tx, conn.clone()));

    writer_loop(Arc::clone(&rs), sink, ctrl_rx, conn.clone()).await;

    drop(reader);
    drop(supervisor);
    drop(slot);
    info!(token = %token.cut(), %conn, "tunnel connection closed");
}

/// Sends queued requests into the tunnel. Exits when the reader is gone,
/// when the ping supervisor gives up, or on the first write error.
async fn writer_loop(
    rs: Arc<RemoteServer>,
    mut sink: SplitSink<WebSocket, Message>,
    mut ctrl_rx: mpsc::Receiver<Ctrl>,
    conn: String,
) {
    loop {
        let request = tokio::select! {
            ctrl = ctrl_rx.recv() => {
                if let Some(Ctrl::PingTimeout) = ctrl {
                    let _ = sink.send(Message::Close(None)).await;
                    tokio::time::sleep(PING_TIMEOUT_CLOSE_GRACE).await;
                    info!(%conn, "closing tunnel after ping timeout");
                }
                return;
            }
            request = rs.dequeue() => match request {
                Some(request) => request,
                None => return,
            },
        };

        if request.deadline <= Instant::now() {
            request.reply(TunnelReply::Error(TunnelError::ExpiredBeforeSend));
            info!(%conn, req = %request.info, "request expired before forwarding");
            continue;
        }

        let id = request.id().unwrap_or(RequestId::ZERO);
        let frame = encode_frame(id, &request.wire);
        if let Err(error) = sink.send(Message::Binary(frame.to_vec())).await {
            // Hand the request back for a retry over whichever tunnel is
            // attached by then.
            request.reply(TunnelReply::Error(TunnelError::SendFailed));
            info!(%conn, %id, %error, "tunnel write failed");
            let _ = sink.send(Message::Close(None)).await;
            tokio::time::sleep(WRITE_ERROR_CLOSE_GRACE).await;
            return;
        }
        info!(%conn, %id, req = %request.info, "request forwarded");
    }
}

/// Reads response frames and pairs them with pending requests. Only binary
/// messages are legal payload; a text frame is a protocol violation that
/// tears the tunnel down.
async fn reader_loop(
    rs: Arc<RemoteServer>,
    mut stream: SplitStream<WebSocket>,
    ping_deadline: Arc<Mutex<Instant>>,
    ws_timeout: Duration,
    ctrl_tx: mpsc::Sender<Ctrl>,
    conn: String,
) {
    let error = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => match decode_frame(Bytes::from(data)) {
                Ok((id, payload)) => match rs.match_pending(id) {
                    Some(request) => {
                        if request.reply(TunnelReply::Response(payload)) {
                            debug!(%conn, %id, "response handed to caller");
                        } else {
                            info!(%conn, %id, "caller is gone, response dropped");
                        }
                    }
                    None => {
                        info!(%conn, %id, "orphan response");
                    }
                },
                Err(error) => break Some(error.to_string()),
            },
            Some(Ok(Message::Text(_))) => break Some("non-binary message received".to_owned()),
            Some(Ok(Message::Ping(_))) => {
                // The websocket layer answers with a pong; our part is the
                // liveness bookkeeping.
                *ping_deadline.lock() = Instant::now() + ws_timeout;
                rs.touch();
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break None,
            Some(Err(error)) => break Some(error.to_string()),
        }
    };

    if let Some(error) = error {
        info!(token = %rs.token().cut(), %conn, %error, "tunnel read ended");
    }
    let _ = ctrl_tx.send(Ctrl::ReaderExited).await;
}

/// Tears the attachment down when the client stops pinging.
async fn ping_supervisor(ping_deadline: Arc<Mutex<Instant>>, ctrl_tx: mpsc::Sender<Ctrl>, conn: String) {
    loop {
        let deadline = *ping_deadline.lock();
        if Instant::now() >= deadline {
            info!(%conn, "ping timeout");
            let _ = ctrl_tx.send(Ctrl::PingTimeout).await;
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

fn check_basic_auth(headers: &HeaderMap, token: &Token, expected_password: &str) -> Result<(), &'static str> {
    let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Err("Authorization required for this token");
    };

    let Some(encoded) = auth
        .get(..6)
        .filter(|prefix| prefix.eq_ignore_ascii_case("basic "))
        .map(|_| auth[6..].trim())
    else {
        return Err("Invalid authorization type (must be Basic)");
    };

    let Ok(decoded) = BASE64.decode(encoded) else {
        return Err("Invalid authorization encoding");
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return Err("Invalid authorization encoding");
    };

    let Some((user, password)) = decoded.split_once(':') else {
        return Err("Invalid authorization format");
    };

    if !(constant_time_equals(user, token.as_str()) && constant_time_equals(password, expected_password)) {
        return Err("Invalid token or password");
    }
    Ok(())
}

/// Timing-safe string comparison; unequal lengths short-circuit to false.
fn constant_time_equals(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn unauthorized(reason: &'static str) -> Response {
    let mut response = HttpError::unauthorized().msg(reason).into_response();
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"wstunnel\""));
    response
}
