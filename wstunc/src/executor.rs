//! Per-connection tunnel loops: frame reader, sink writer, pinger, and one
//! worker per tunneled request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt as _, StreamExt as _};
use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tunnel_proto::{decode_frame, encode_frame, parse_request, serialize_response, ParsedRequest, RequestId};
use wstun_task::ChildTask;

use crate::dialer::WsStream;
use crate::ClientInner;

const OUTBOUND_QUEUE: usize = 32;

/// Serves one established tunnel connection until it dies or the client is
/// asked to let go of it.
pub(crate) async fn run_connection(client: &Arc<ClientInner>, ws: WsStream) {
    let ws_timeout = client.cfg.ws_timeout;
    let (sink, mut stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let (dead_tx, mut dead_rx) = mpsc::channel::<()>(2);
    let last_activity = Arc::new(Mutex::new(Instant::now()));

    let writer = ChildTask::spawn(writer_loop(sink, out_rx, dead_tx.clone()));
    let pinger = ChildTask::spawn(pinger_loop(
        out_tx.clone(),
        Arc::clone(&last_activity),
        ws_timeout,
        dead_tx,
    ));

    let mut shutdown = client.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = client.drop_conn.notified() => {
                info!("dropping tunnel connection on request");
                break;
            }
            _ = dead_rx.recv() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    *last_activity.lock() = Instant::now();
                    let (id, request) = match decode_request(Bytes::from(data)) {
                        Ok(decoded) => decoded,
                        Err(error) => {
                            warn!(%error, "bad tunnel frame, closing connection");
                            break;
                        }
                    };
                    ChildTask::spawn(handle_request(Arc::clone(client), id, request, out_tx.clone())).detach();
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    *last_activity.lock() = Instant::now();
                }
                Some(Ok(Message::Text(_))) => {
                    warn!("non-binary tunnel message, closing connection");
                    break;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("tunnel closed by server");
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(error)) => {
                    info!(%error, "tunnel read error");
                    break;
                }
            },
        }
    }

    drop(writer);
    drop(pinger);
}

fn decode_request(frame: Bytes) -> Result<(RequestId, ParsedRequest), tunnel_proto::FrameError> {
    let (id, payload) = decode_frame(frame)?;
    let request = parse_request(payload)?;
    Ok((id, request))
}

async fn writer_loop(mut sink: SplitSink<WsStream, Message>, mut out_rx: mpsc::Receiver<Message>, dead_tx: mpsc::Sender<()>) {
    while let Some(message) = out_rx.recv().await {
        if let Err(error) = sink.send(message).await {
            info!(%error, "tunnel write error");
            let _ = dead_tx.try_send(());
            return;
        }
    }
}

/// Keeps the server's ping supervisor fed and watches for a dead peer.
async fn pinger_loop(
    out_tx: mpsc::Sender<Message>,
    last_activity: Arc<Mutex<Instant>>,
    ws_timeout: Duration,
    dead_tx: mpsc::Sender<()>,
) {
    let period = ws_timeout / 3;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if last_activity.lock().elapsed() > ws_timeout {
            warn!("no tunnel traffic within the timeout, closing connection");
            let _ = dead_tx.try_send(());
            return;
        }
        if out_tx.send(Message::Ping(Vec::new())).await.is_err() {
            return;
        }
    }
}

/// Executes one tunneled request against the local back-end and frames the
/// response. Failures never kill the tunnel; they come back as a synthesized
/// 502.
async fn handle_request(client: Arc<ClientInner>, id: RequestId, request: ParsedRequest, out_tx: mpsc::Sender<Message>) {
    let payload = match client.local_handler.as_ref() {
        Some(handler) => handler.handle(request).await,
        None => match execute(&client, request).await {
            Ok(payload) => payload,
            Err(response) => response,
        },
    };
    let frame = encode_frame(id, &payload);
    let _ = out_tx.send(Message::Binary(frame.to_vec())).await;
}

/// Resolves the target and performs the local HTTP call.
///
/// The error side carries a complete HTTP/1.1 response to send back over
/// the tunnel (403 for a refused `X-Host`, 400 for no target, 502 for a
/// transport failure).
async fn execute(client: &ClientInner, request: ParsedRequest) -> Result<Bytes, Bytes> {
    let base = resolve_target(client, &request.headers)?;
    let url = format!("{base}{}", request.target);

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| synthesize(400, "Bad Request", "unsupported HTTP method"))?;

    let mut local_request = client.http.request(method.clone(), url.as_str());
    for (name, value) in &request.headers {
        if skip_outbound_header(name.as_str()) {
            continue;
        }
        local_request = local_request.header(name, value);
    }

    debug!(%method, url = %url, "performing local request");
    let response = local_request
        .body(request.body)
        .send()
        .await
        .map_err(|error| synthesize(502, "Bad Gateway", &format!("{error:#}")))?;

    let status = response.status();
    let reason = status.canonical_reason().unwrap_or("");
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|error| synthesize(502, "Bad Gateway", &format!("{error:#}")))?;

    info!(url = %url, status = status.as_u16(), "local request done");
    Ok(serialize_response(status.as_u16(), reason, &headers, &body))
}

/// Picks the back-end for a request: a full-regexp-matched `X-Host`, or the
/// configured server.
fn resolve_target(client: &ClientInner, headers: &HeaderMap) -> Result<String, Bytes> {
    let x_host = headers.get("x-host").and_then(|v| v.to_str().ok()).unwrap_or("");

    if !x_host.is_empty() {
        return match client.cfg.x_host_allow.as_ref() {
            Some(allow) if allow.is_match(x_host) => Ok(x_host.trim_end_matches('/').to_owned()),
            _ => {
                info!(x_host = %x_host, "X-Host does not match regexp, refusing");
                Err(synthesize(403, "Forbidden", "X-Host header does not match regexp"))
            }
        };
    }

    match client.cfg.server.as_deref() {
        Some(server) => Ok(server.to_owned()),
        None => Err(synthesize(400, "Bad Request", "no back-end server configured")),
    }
}

/// Headers that must not be replayed verbatim on the local connection: the
/// client owns its own connection to the back-end, and reqwest derives
/// `Host`/`Content-Length` itself.
fn skip_outbound_header(name: &str) -> bool {
    matches!(
        name,
        "host" | "x-host" | "content-length" | "transfer-encoding" | "connection" | "keep-alive" | "upgrade"
    )
}

/// Builds a minimal HTTP/1.1 response carrying an executor-side verdict.
fn synthesize(status: u16, reason: &str, body: &str) -> Bytes {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    serialize_response(status, reason, &headers, body.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, ClientConfig};
    use crate::WsTunnelClient;

    fn client(regexp: Option<&str>, server: Option<&str>) -> Arc<ClientInner> {
        let args = Args {
            token: "token1234567890abcd".to_owned(),
            tunnel: "ws://tunnel.example:8080".to_owned(),
            server: server.map(str::to_owned),
            insecure: false,
            regexp: regexp.map(str::to_owned),
            timeout: 30,
            pidfile: None,
            logfile: None,
            statusfile: None,
            proxy: None,
            client_ports: None,
            certfile: None,
            reconnect_delay: 5,
            max_retries: 0,
        };
        let cfg = ClientConfig::from_args(&args).unwrap();
        WsTunnelClient::new(cfg).unwrap().into_inner_for_tests()
    }

    fn headers_with_x_host(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-host", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn x_host_full_match_is_required() {
        let client = client(Some("^http://127\\.0\\.0\\.[0-9]:[0-9]+$"), None);

        let ok = resolve_target(&client, &headers_with_x_host("http://127.0.0.1:8080"));
        assert_eq!(ok.unwrap(), "http://127.0.0.1:8080");

        let evil = resolve_target(&client, &headers_with_x_host("http://evil.example/http://127.0.0.1:80"));
        let body = evil.unwrap_err();
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("HTTP/1.1 403"));
        assert!(text.contains("does not match regexp"));
    }

    #[test]
    fn x_host_without_regexp_is_refused() {
        let client = client(None, Some("http://127.0.0.1:3000"));
        let refused = resolve_target(&client, &headers_with_x_host("http://internal.example"));
        let text = String::from_utf8_lossy(&refused.unwrap_err()).into_owned();
        assert!(text.starts_with("HTTP/1.1 403"));
    }

    #[test]
    fn missing_target_yields_400() {
        let client = client(None, None);
        let refused = resolve_target(&client, &HeaderMap::new());
        let text = String::from_utf8_lossy(&refused.unwrap_err()).into_owned();
        assert!(text.starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn configured_server_is_the_default_target() {
        let client = client(None, Some("http://127.0.0.1:3000"));
        let target = resolve_target(&client, &HeaderMap::new()).unwrap();
        assert_eq!(target, "http://127.0.0.1:3000");
    }

    #[test]
    fn synthesized_responses_parse_back() {
        let payload = synthesize(502, "Bad Gateway", "connection refused");
        let parsed = tunnel_proto::parse_response(payload).unwrap();
        assert_eq!(parsed.status, 502);
        assert_eq!(&parsed.body[..], b"connection refused");
    }
}
