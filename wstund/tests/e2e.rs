//! End-to-end scenarios: a real broker, a real client, a throwaway local
//! back-end, and plain HTTP callers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::Router;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use wstun_task::ChildTask;
use wstund::config::Conf;
use wstund::token::Token;
use wstund::{api, AppState};

const TOKEN: &str = "token1234567890abcd";

fn test_conf() -> Conf {
    Conf {
        host: "127.0.0.1".to_owned(),
        port: 0,
        base_path: String::new(),
        ws_timeout: Duration::from_secs(30),
        http_timeout: Duration::from_secs(10),
        max_requests_per_tunnel: 20,
        max_clients_per_token: 0,
        passwords: HashMap::new(),
        robowhois_token: None,
        pid_file: None,
        log_file: None,
    }
}

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    _task: ChildTask<()>,
}

impl TestServer {
    async fn start(conf: Conf) -> TestServer {
        let state = AppState::new(Arc::new(conf));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = api::make_router(state.clone());
        let task = ChildTask::spawn(async move {
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        TestServer {
            addr,
            state,
            _task: task,
        }
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/_tunnel", self.addr)
    }
}

/// Back-end answering `/hello` with WORLD on the first hit and AGAIN after.
async fn start_backend() -> (String, ChildTask<()>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new().route(
        "/hello",
        get(move || {
            let hits = Arc::clone(&hits);
            async move {
                let body = if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    "WORLD"
                } else {
                    "AGAIN"
                };
                ([(CONTENT_TYPE, "text/world")], body)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = ChildTask::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), task)
}

fn client_args(server: &TestServer, backend: Option<&str>, token: &str) -> wstunc::config::Args {
    wstunc::config::Args {
        token: token.to_owned(),
        tunnel: format!("ws://{}", server.addr),
        server: backend.map(str::to_owned),
        insecure: false,
        regexp: None,
        timeout: 30,
        pidfile: None,
        logfile: None,
        statusfile: None,
        proxy: None,
        client_ports: None,
        certfile: None,
        reconnect_delay: 1,
        max_retries: 0,
    }
}

fn start_client(args: &wstunc::config::Args) -> (wstunc::WsTunnelClient, ChildTask<anyhow::Result<()>>) {
    let cfg = wstunc::config::ClientConfig::from_args(args).unwrap();
    let client = wstunc::WsTunnelClient::new(cfg).unwrap();
    let runner = client.clone();
    let task = ChildTask::spawn(async move { runner.run().await });
    (client, task)
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn wait_until_attached(server: &TestServer, client: &wstunc::WsTunnelClient, token: &str) {
    let registry = Arc::clone(&server.state.registry);
    let token = Token::from(token);
    let client = client.clone();
    wait_for("client attached", move || {
        client.is_connected() && registry.get(&token, false).is_some()
    })
    .await;
}

fn raw_dial_request(server: &TestServer, token: &str, authorization: Option<&str>) -> tungstenite::handshake::client::Request {
    let mut request = server.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", token.parse().unwrap());
    if let Some(authorization) = authorization {
        request
            .headers_mut()
            .insert("Authorization", authorization.parse().unwrap());
    }
    request
}

fn http_error_of(error: tungstenite::Error) -> tungstenite::handshake::client::Response {
    match error {
        tungstenite::Error::Http(response) => response,
        other => panic!("expected an HTTP handshake rejection, got: {other:?}"),
    }
}

#[tokio::test]
async fn basic_get_roundtrip() {
    let server = TestServer::start(test_conf()).await;
    let (backend_url, _backend) = start_backend().await;
    let args = client_args(&server, Some(&backend_url), TOKEN);
    let (client, _client_task) = start_client(&args);
    wait_until_attached(&server, &client, TOKEN).await;

    let response = reqwest::get(server.http_url(&format!("/_token/{TOKEN}/hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get(CONTENT_TYPE).unwrap().to_str().unwrap(),
        "text/world"
    );
    assert_eq!(response.text().await.unwrap(), "WORLD");

    client.stop();
}

#[tokio::test]
async fn x_token_header_routing() {
    let server = TestServer::start(test_conf()).await;
    let (backend_url, _backend) = start_backend().await;
    let args = client_args(&server, Some(&backend_url), TOKEN);
    let (client, _client_task) = start_client(&args);
    wait_until_attached(&server, &client, TOKEN).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(server.http_url("/hello"))
        .header("X-Token", TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "WORLD");

    let missing = caller.get(server.http_url("/hello")).send().await.unwrap();
    assert_eq!(missing.status(), 400);
    assert!(missing.text().await.unwrap().contains("X-Token"));

    client.stop();
}

#[tokio::test]
async fn unknown_token_is_a_404() {
    let server = TestServer::start(test_conf()).await;

    let response = reqwest::get(server.http_url("/_token/badtokenbadtoken/x"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(content_type.starts_with("text/plain"));
    assert!(response.text().await.unwrap().contains("long time"));
}

#[tokio::test]
async fn wrong_password_is_a_401_and_counts_no_client() {
    let mut conf = test_conf();
    conf.passwords
        .insert(Token::from(TOKEN), "secret123".to_owned());
    conf.max_clients_per_token = 5;
    let server = TestServer::start(conf).await;

    let credentials = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(format!("{TOKEN}:wrong"))
    };
    let request = raw_dial_request(&server, TOKEN, Some(&format!("Basic {credentials}")));
    let error = tokio_tungstenite::connect_async(request).await.unwrap_err();
    let response = http_error_of(error);

    assert_eq!(response.status(), 401);
    assert_eq!(
        response.headers().get("www-authenticate").unwrap().to_str().unwrap(),
        "Basic realm=\"wstunnel\""
    );
    let (_, total) = server.state.registry.client_counts();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn token_length_boundary() {
    let server = TestServer::start(test_conf()).await;

    // 16 characters: accepted.
    let sixteen = "abcdefgh12345678";
    let (ws, _) = tokio_tungstenite::connect_async(raw_dial_request(&server, sixteen, None))
        .await
        .unwrap();
    drop(ws);

    // 15 characters: rejected with 400.
    let fifteen = "abcdefgh1234567";
    let error = tokio_tungstenite::connect_async(raw_dial_request(&server, fifteen, None))
        .await
        .unwrap_err();
    assert_eq!(http_error_of(error).status(), 400);
}

#[tokio::test]
async fn client_cap_is_enforced_and_recovers() {
    let mut conf = test_conf();
    conf.max_clients_per_token = 2;
    let server = TestServer::start(conf).await;
    let (backend_url, _backend) = start_backend().await;

    let args = client_args(&server, Some(&backend_url), TOKEN);
    let (first, _first_task) = start_client(&args);
    wait_until_attached(&server, &first, TOKEN).await;
    let (second, _second_task) = start_client(&args);
    wait_until_attached(&server, &second, TOKEN).await;

    let registry = Arc::clone(&server.state.registry);
    wait_for("two clients counted", || registry.client_counts().1 == 2).await;

    // The third dial is refused outright.
    let error = tokio_tungstenite::connect_async(raw_dial_request(&server, TOKEN, None))
        .await
        .unwrap_err();
    assert_eq!(http_error_of(error).status(), 429);
    assert_eq!(server.state.registry.client_counts().1, 2);

    // After the first client goes away, a slot frees up.
    first.stop();
    let registry = Arc::clone(&server.state.registry);
    wait_for("slot released", || registry.client_counts().1 == 1).await;

    let (ws, _) = tokio_tungstenite::connect_async(raw_dial_request(&server, TOKEN, None))
        .await
        .unwrap();
    drop(ws);
    second.stop();
}

#[tokio::test]
async fn reconnect_resumes_service() {
    let server = TestServer::start(test_conf()).await;
    let (backend_url, _backend) = start_backend().await;
    let args = client_args(&server, Some(&backend_url), TOKEN);
    let (client, _client_task) = start_client(&args);
    wait_until_attached(&server, &client, TOKEN).await;

    let url = server.http_url(&format!("/_token/{TOKEN}/hello"));
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "WORLD");

    client.drop_connection();
    let probe = client.clone();
    wait_for("client reconnected", move || {
        probe.stats().total_connections >= 2 && probe.is_connected()
    })
    .await;

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200, "no caller should fail just because of a reconnect");
    assert_eq!(response.text().await.unwrap(), "AGAIN");

    client.stop();
}

#[tokio::test]
async fn x_host_substring_match_is_rejected() {
    let server = TestServer::start(test_conf()).await;
    let mut args = client_args(&server, None, TOKEN);
    args.regexp = Some("^http://127\\.0\\.0\\.[0-9]:[0-9]+$".to_owned());
    let (client, _client_task) = start_client(&args);
    wait_until_attached(&server, &client, TOKEN).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(server.http_url(&format!("/_token/{TOKEN}/x")))
        .header("X-Host", "http://evil.example/http://127.0.0.1:80")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert!(response.text().await.unwrap().contains("does not match regexp"));

    client.stop();
}

#[tokio::test]
async fn x_host_full_match_is_served() {
    let server = TestServer::start(test_conf()).await;
    let (backend_url, _backend) = start_backend().await;
    let backend_addr = backend_url.strip_prefix("http://").unwrap().to_owned();

    let mut args = client_args(&server, None, TOKEN);
    args.regexp = Some("^http://127\\.0\\.0\\.1:[0-9]+$".to_owned());
    let (client, _client_task) = start_client(&args);
    wait_until_attached(&server, &client, TOKEN).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(server.http_url(&format!("/_token/{TOKEN}/hello")))
        .header("X-Host", format!("http://{backend_addr}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "WORLD");

    client.stop();
}

#[tokio::test]
async fn full_queue_fails_fast() {
    let mut conf = test_conf();
    conf.max_requests_per_tunnel = 2;
    conf.http_timeout = Duration::from_secs(2);
    let server = TestServer::start(conf).await;

    // A tunnel exists but nothing consumes its queue.
    server.state.registry.get_or_create(&Token::from(TOKEN));

    let url = server.http_url(&format!("/_token/{TOKEN}/slow"));
    let mut fillers = Vec::new();
    for _ in 0..2 {
        let url = url.clone();
        fillers.push(tokio::spawn(async move { reqwest::get(&url).await }));
    }
    // Let the fillers occupy the whole queue.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 504);
    assert!(response.text().await.unwrap().contains("too many requests in-flight"));
    assert!(started.elapsed() < Duration::from_secs(1), "queue-full must fail fast");

    for filler in fillers {
        let response = filler.await.unwrap().unwrap();
        assert_eq!(response.status(), 504);
    }
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let mut conf = test_conf();
    conf.http_timeout = Duration::from_secs(2);
    let server = TestServer::start(conf).await;

    // Attach a tunnel that accepts frames but never answers them.
    let (ws, _) = tokio_tungstenite::connect_async(raw_dial_request(&server, TOKEN, None))
        .await
        .unwrap();
    let registry = Arc::clone(&server.state.registry);
    wait_for("tunnel registered", move || {
        registry.get(&Token::from(TOKEN), false).is_some()
    })
    .await;

    let response = reqwest::get(server.http_url(&format!("/_token/{TOKEN}/x")))
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
    assert_eq!(response.text().await.unwrap(), "Tunnel timeout");
    drop(ws);
}

#[tokio::test]
async fn health_check_and_stats() {
    let server = TestServer::start(test_conf()).await;
    let (backend_url, _backend) = start_backend().await;
    let args = client_args(&server, Some(&backend_url), TOKEN);
    let (client, _client_task) = start_client(&args);
    wait_until_attached(&server, &client, TOKEN).await;

    let health = reqwest::get(server.http_url("/_health_check")).await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "WSTUNSRV RUNNING\n");

    let stats = reqwest::get(server.http_url("/_stats"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(stats.contains("tunnels=1"));
    assert!(stats.contains("max_requests_per_tunnel=20"));
    assert!(stats.contains("max_clients_per_token=0"));
    // Localhost callers get the per-tunnel block.
    assert!(stats.contains("tunnel00_token=token123..."));
    assert!(stats.contains("tunnel00_req_pending=0"));
    assert!(stats.contains("req_pending=0"));
    assert!(stats.contains("dead_tunnels=0"));

    client.stop();
}

/// Minimal HTTP CONNECT proxy: accepts one CONNECT per connection, dials the
/// requested target, then shovels bytes both ways.
async fn start_connect_proxy() -> (String, ChildTask<()>) {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = ChildTask::spawn(async move {
        loop {
            let Ok((mut downstream, _)) = listener.accept().await else {
                return;
            };
            ChildTask::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match downstream.read(&mut byte).await {
                        Ok(n) if n > 0 => head.push(byte[0]),
                        _ => return,
                    }
                }
                let head = String::from_utf8_lossy(&head).into_owned();
                let Some(target) = head.split_whitespace().nth(1) else {
                    return;
                };
                let Ok(mut upstream) = tokio::net::TcpStream::connect(target).await else {
                    return;
                };
                if downstream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await;
            })
            .detach();
        }
    });
    (format!("http://{addr}"), task)
}

#[tokio::test]
async fn dialing_through_a_connect_proxy() {
    let server = TestServer::start(test_conf()).await;
    let (backend_url, _backend) = start_backend().await;
    let (proxy_url, _proxy) = start_connect_proxy().await;

    let mut args = client_args(&server, Some(&backend_url), TOKEN);
    args.proxy = Some(proxy_url);
    let (client, _client_task) = start_client(&args);
    wait_until_attached(&server, &client, TOKEN).await;

    let response = reqwest::get(server.http_url(&format!("/_token/{TOKEN}/hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "WORLD");

    client.stop();
}

#[tokio::test]
async fn outbound_connections_bind_configured_client_ports() {
    let server = TestServer::start(test_conf()).await;
    let (backend_url, _backend) = start_backend().await;

    let mut args = client_args(&server, Some(&backend_url), TOKEN);
    args.client_ports = Some("41600..41699".to_owned());
    let (client, _client_task) = start_client(&args);
    wait_until_attached(&server, &client, TOKEN).await;

    let rs = server.state.registry.get(&Token::from(TOKEN), false).unwrap();
    let remote_addr = rs.remote_info().remote_addr;
    let port: u16 = remote_addr.rsplit(':').next().unwrap().parse().unwrap();
    assert!(
        (41600..=41699).contains(&port),
        "peer port {port} should come from the configured range"
    );

    client.stop();
}

struct EmbeddedBackend;

#[async_trait::async_trait]
impl wstunc::LocalHandler for EmbeddedBackend {
    async fn handle(&self, request: wstunc::ParsedRequest) -> bytes::Bytes {
        let mut headers = http::HeaderMap::new();
        headers.insert(CONTENT_TYPE, "text/plain".parse().unwrap());
        tunnel_proto::serialize_response(200, "OK", &headers, format!("embedded:{}", request.target).as_bytes())
    }
}

#[tokio::test]
async fn embedded_handler_serves_requests() {
    let server = TestServer::start(test_conf()).await;
    let args = client_args(&server, None, TOKEN);
    let cfg = wstunc::config::ClientConfig::from_args(&args).unwrap();
    let client = wstunc::WsTunnelClient::with_local_handler(cfg, Arc::new(EmbeddedBackend)).unwrap();
    let runner = client.clone();
    let _client_task = ChildTask::spawn(async move { runner.run().await });
    wait_until_attached(&server, &client, TOKEN).await;

    let response = reqwest::get(server.http_url(&format!("/_token/{TOKEN}/echo")))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "embedded:/echo");

    client.stop();
}

#[tokio::test]
async fn base_path_mounts_the_surface() {
    let mut conf = test_conf();
    conf.base_path = "/wstun".to_owned();
    let server = TestServer::start(conf).await;

    let health = reqwest::get(server.http_url("/wstun/_health_check")).await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "WSTUNSRV RUNNING\n");

    // Outside the base path there is nothing.
    let outside = reqwest::get(server.http_url("/_health_check")).await.unwrap();
    assert_eq!(outside.status(), 404);
}
