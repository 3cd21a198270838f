//! Tunnel dialing: TCP (optionally proxied or bound to a configured local
//! port), TLS for `wss`, then the websocket handshake carrying the token.

use anyhow::Context as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::HeaderValue;
use tokio::net::{TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::proxy;
use crate::tls;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the tunnel endpoint, presenting the token and optional password.
pub async fn connect(cfg: &ClientConfig) -> anyhow::Result<WsStream> {
    let scheme = cfg.tunnel.scheme();
    let host = cfg.tunnel.host_str().context("tunnel URL has no host")?;
    let port = cfg
        .tunnel
        .port_or_known_default()
        .context("tunnel URL has no port and no default")?;

    let mut request = format!("{scheme}://{host}:{port}/_tunnel")
        .into_client_request()
        .context("failed to build websocket request")?;
    let headers = request.headers_mut();
    headers.insert(
        http::header::ORIGIN,
        HeaderValue::from_str(&cfg.token).context("token is not a valid header value")?,
    );
    if let Some(password) = cfg.password.as_deref() {
        let credentials = BASE64.encode(format!("{}:{password}", cfg.token));
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {credentials}")).context("credentials are not a valid header value")?,
        );
    }
    headers.insert("X-Client-Version", HeaderValue::from_static(env!("CARGO_PKG_VERSION")));

    let stream = match cfg.proxy.as_ref() {
        Some(proxy) => proxy::connect_via(proxy, host, port).await?,
        None => tcp_connect(cfg, host, port).await?,
    };

    let connector = if scheme == "wss" {
        Connector::Rustls(tls::client_config(cfg.insecure, cfg.ca_file.as_deref())?)
    } else {
        Connector::Plain
    };

    let handshake = client_async_tls_with_config(request, stream, None, Some(connector));
    let (ws, _response) = tokio::time::timeout(cfg.ws_timeout, handshake)
        .await
        .context("websocket handshake timed out")?
        .context("websocket handshake failed")?;

    Ok(ws)
}

async fn tcp_connect(cfg: &ClientConfig, host: &str, port: u16) -> anyhow::Result<TcpStream> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("lookup of {host} failed"))?
        .next()
        .with_context(|| format!("failed to resolve {host}"))?;

    if cfg.client_ports.is_empty() {
        return TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"));
    }

    // Walk the configured source ports until one is free.
    for &local_port in &cfg.client_ports {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create socket")?;

        let local: std::net::SocketAddr = if addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, local_port).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, local_port).into()
        };
        if socket.bind(local).is_err() {
            continue;
        }
        match socket.connect(addr).await {
            Ok(stream) => {
                debug!(local_port, "bound outbound connection to client port");
                return Ok(stream);
            }
            Err(error) => {
                debug!(local_port, %error, "client port connect failed");
            }
        }
    }

    anyhow::bail!("no available client port out of {} configured", cfg.client_ports.len())
}
