//! HTTP CONNECT proxy support for the tunnel dialer.

use anyhow::Context as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use url::Url;

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Opens a TCP stream to `host:port` through an HTTP CONNECT proxy.
///
/// Proxy credentials come from the userinfo part of the proxy URL.
pub async fn connect_via(proxy: &Url, host: &str, port: u16) -> anyhow::Result<TcpStream> {
    let proxy_host = proxy.host_str().context("proxy URL has no host")?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(3128);

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .with_context(|| format!("failed to connect to proxy {proxy_host}:{proxy_port}"))?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", BASE64.encode(credentials)));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await.context("proxy CONNECT write failed")?;

    // Read until the end of the response head; CONNECT has no body on
    // success, so anything after the blank line belongs to the tunnel.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            anyhow::bail!("proxy CONNECT response too large");
        }
        let n = stream.read(&mut byte).await.context("proxy CONNECT read failed")?;
        if n == 0 {
            anyhow::bail!("proxy closed the connection during CONNECT");
        }
        head.push(byte[0]);
    }

    let status_line = head
        .split(|&b| b == b'\r')
        .next()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .context("malformed proxy CONNECT response")?;
    if !(200..300).contains(&status) {
        anyhow::bail!("proxy refused CONNECT: {status_line}");
    }

    Ok(stream)
}
