//! Reverse-DNS and WHOIS enrichment for attached tunnels.
//!
//! Fired as a detached task on every tunnel attach; results land in the
//! tunnel's remote info and show up in `/_stats`. Lookups are cached per IP
//! for the process lifetime.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;

use crate::tunnel::RemoteServer;

static DNS_CACHE: LazyLock<Mutex<HashMap<IpAddr, String>>> = LazyLock::new(|| Mutex::new(HashMap::new()));
static WHOIS_CACHE: LazyLock<Mutex<HashMap<IpAddr, String>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

static ORG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("Org[^a-zA-Z]?Name[^a-zA-Z]*([ -~]*)").expect("static regex"));
static NET_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("network:Organization[^a-zA-Z]*([ -~]*)").expect("static regex"));

/// Resolves the attachment address and stores the result on the tunnel.
pub async fn enrich(rs: Arc<RemoteServer>, addr: String, robowhois_token: Option<String>) {
    let Some(ip) = extract_ip(&addr) else {
        debug!(addr = %addr, "no IP address to enrich");
        return;
    };

    let name = reverse_dns(ip).await;
    let whois = match robowhois_token {
        Some(token) => whois_org_name(ip, &token).await,
        None => String::new(),
    };
    rs.set_remote_info(name, whois);
}

/// Extracts the client IP from an `ip:port` peer address or the first entry
/// of an `X-Forwarded-For` list.
fn extract_ip(addr: &str) -> Option<IpAddr> {
    let first = addr.split(',').next()?.trim();
    if let Ok(ip) = first.parse() {
        return Some(ip);
    }
    if let Ok(sock) = first.parse::<std::net::SocketAddr>() {
        return Some(sock.ip());
    }
    None
}

async fn reverse_dns(ip: IpAddr) -> String {
    if let Some(cached) = DNS_CACHE.lock().get(&ip) {
        return cached.clone();
    }

    let resolved = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
        .await
        .ok()
        .flatten()
        .unwrap_or_default();

    info!(%ip, dns = %resolved, "DNS lookup");
    DNS_CACHE.lock().insert(ip, resolved.clone());
    resolved
}

#[derive(Deserialize)]
struct WhoisData {
    response: WhoisResponse,
}

#[derive(Deserialize)]
struct WhoisResponse {
    #[serde(default)]
    parts: Vec<WhoisPart>,
}

#[derive(Deserialize)]
struct WhoisPart {
    #[serde(default)]
    body: String,
}

/// Organisation name for `ip` according to the robowhois API.
async fn whois_org_name(ip: IpAddr, api_token: &str) -> String {
    if let Some(cached) = WHOIS_CACHE.lock().get(&ip) {
        return cached.clone();
    }

    let result = query_robowhois(ip, api_token).await.unwrap_or_else(|error| {
        info!(%ip, %error, "whois lookup failed");
        String::new()
    });
    WHOIS_CACHE.lock().insert(ip, result.clone());
    result
}

async fn query_robowhois(ip: IpAddr, api_token: &str) -> anyhow::Result<String> {
    let url = format!("http://api.robowhois.com/v1/whois/{ip}/parts");
    let data: WhoisData = reqwest::Client::new()
        .get(url)
        .basic_auth(api_token, Some("X"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let body = data
        .response
        .parts
        .last()
        .map(|p| p.body.as_str())
        .unwrap_or_default();
    Ok(extract_org_name(body).unwrap_or_default())
}

fn extract_org_name(body: &str) -> Option<String> {
    let captures = ORG_NAME_RE
        .captures_iter(body)
        .last()
        .or_else(|| NET_NAME_RE.captures_iter(body).last())?;
    Some(captures.get(1)?.as_str().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_extraction_handles_peer_and_forwarded_forms() {
        assert_eq!(extract_ip("127.0.0.1:4433"), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(extract_ip("10.0.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(extract_ip("10.0.0.1, 192.168.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(extract_ip("not-an-address"), None);
    }

    #[test]
    fn org_name_extraction() {
        let body = "NetRange: 1.2.3.0 - 1.2.3.255\nOrgName: Example Networks LLC\n";
        assert_eq!(extract_org_name(body).as_deref(), Some("Example Networks LLC"));

        let rwhois = "network:Organization: Example Rwhois Org\n";
        assert_eq!(extract_org_name(rwhois).as_deref(), Some("Example Rwhois Org"));

        assert_eq!(extract_org_name("nothing useful"), None);
    }
}
