use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;

use crate::token::{Token, MIN_TOKEN_LEN};

/// Default capacity of the per-tunnel request queue.
pub const DEFAULT_MAX_REQUESTS_PER_TUNNEL: usize = 20;

/// Hard cap applied to the queue allocation no matter what was configured.
pub const QUEUE_CAPACITY_CAP: usize = 1000;

const WS_TIMEOUT_MIN_SECS: i64 = 3;
const WS_TIMEOUT_MAX_SECS: i64 = 600;

#[derive(Debug, Parser)]
#[command(name = "wstund", version, about = "Reverse HTTP tunnel broker")]
pub struct Args {
    /// Port for the http/ws server to listen on
    #[arg(long, default_value_t = 80)]
    pub port: u16,

    /// Host for the http/ws server to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Base path for routing when behind a proxy (e.g. "/wstunnel")
    #[arg(long = "base-path", default_value = "")]
    pub base_path: String,

    /// Path for pidfile
    #[arg(long)]
    pub pidfile: Option<Utf8PathBuf>,

    /// Path for log file
    #[arg(long)]
    pub logfile: Option<Utf8PathBuf>,

    /// Timeout on websocket pings, in seconds
    #[arg(long, default_value_t = 30)]
    pub wstimeout: i64,

    /// Timeout for tunneled http requests, in seconds
    #[arg(long, default_value_t = 20 * 60)]
    pub httptimeout: i64,

    /// Syslog facility to log to
    #[arg(long)]
    pub syslog: Option<String>,

    /// robowhois.com API token
    #[arg(long)]
    pub robowhois: Option<String>,

    /// Comma-separated list of token:password pairs
    #[arg(long, default_value = "")]
    pub passwords: String,

    /// Maximum number of queued requests per tunnel
    #[arg(long = "max-requests-per-tunnel", default_value_t = DEFAULT_MAX_REQUESTS_PER_TUNNEL as i64)]
    pub max_requests_per_tunnel: i64,

    /// Maximum number of clients per token (0 for unlimited)
    #[arg(long = "max-clients-per-token", default_value_t = 0)]
    pub max_clients_per_token: i64,
}

/// Validated broker configuration.
#[derive(Debug)]
pub struct Conf {
    pub host: String,
    pub port: u16,
    /// Normalized base path; empty when the surface is mounted at the root.
    pub base_path: String,
    pub ws_timeout: Duration,
    pub http_timeout: Duration,
    pub max_requests_per_tunnel: usize,
    /// 0 means unlimited.
    pub max_clients_per_token: usize,
    pub passwords: HashMap<Token, String>,
    pub robowhois_token: Option<String>,
    pub pid_file: Option<Utf8PathBuf>,
    pub log_file: Option<Utf8PathBuf>,
}

impl Conf {
    /// Builds the runtime configuration, normalizing and clamping flag
    /// values the same way regardless of where they came from.
    pub fn from_args(args: &Args) -> Conf {
        let base_path = normalize_base_path(&args.base_path);
        if !base_path.is_empty() {
            info!(base_path = %base_path, "base path configured");
        }

        let max_requests_per_tunnel = validate_max_requests(args.max_requests_per_tunnel);
        let max_clients_per_token = validate_max_clients(args.max_clients_per_token);

        let ws_timeout = calc_ws_timeout(args.wstimeout);
        let http_timeout = Duration::from_secs(args.httptimeout.max(1) as u64);
        info!(?http_timeout, "remote request timeout");

        Conf {
            host: args.host.clone(),
            port: args.port,
            base_path,
            ws_timeout,
            http_timeout,
            max_requests_per_tunnel,
            max_clients_per_token,
            passwords: parse_passwords(&args.passwords),
            robowhois_token: args.robowhois.clone(),
            pid_file: args.pidfile.clone(),
            log_file: args.logfile.clone(),
        }
    }

    /// Queue allocation size: the configured per-tunnel maximum, capped.
    pub fn queue_capacity(&self) -> usize {
        self.max_requests_per_tunnel.min(QUEUE_CAPACITY_CAP)
    }
}

/// Clamps the websocket ping timeout to [3, 600] seconds.
pub fn calc_ws_timeout(secs: i64) -> Duration {
    let clamped = secs.clamp(WS_TIMEOUT_MIN_SECS, WS_TIMEOUT_MAX_SECS);
    if clamped != secs {
        info!(requested = secs, effective = clamped, "websocket timeout clamped");
    }
    Duration::from_secs(clamped as u64)
}

fn validate_max_requests(value: i64) -> usize {
    if value < 0 {
        error!(value, default = DEFAULT_MAX_REQUESTS_PER_TUNNEL, "max-requests-per-tunnel cannot be negative, using default");
        DEFAULT_MAX_REQUESTS_PER_TUNNEL
    } else if value == 0 {
        warn!(default = DEFAULT_MAX_REQUESTS_PER_TUNNEL, "max-requests-per-tunnel set to 0, using default queue size");
        DEFAULT_MAX_REQUESTS_PER_TUNNEL
    } else {
        if value > QUEUE_CAPACITY_CAP as i64 {
            warn!(value, cap = QUEUE_CAPACITY_CAP, "max-requests-per-tunnel is very high, queue allocation will be capped");
        }
        value as usize
    }
}

fn validate_max_clients(value: i64) -> usize {
    if value < 0 {
        error!(value, "max-clients-per-token cannot be negative, disabling limit");
        0
    } else {
        if value > 1000 {
            warn!(value, "max-clients-per-token is very high, may cause resource issues");
        }
        value as usize
    }
}

/// Parses the `tok1:pwd1,tok2:pwd2,…` flag. Invalid pairs are skipped with a
/// warning; a duplicate token overwrites the earlier entry.
pub fn parse_passwords(flag: &str) -> HashMap<Token, String> {
    let mut passwords = HashMap::new();
    if flag.is_empty() {
        return passwords;
    }

    for pair in flag.split(',') {
        let Some((tok, pass)) = pair.split_once(':') else {
            warn!(pair, "invalid token:password pair");
            continue;
        };
        let tok = tok.trim();
        let pass = pass.trim();

        if tok.is_empty() {
            error!(pair, "empty token in token:password pair");
            continue;
        }
        if pass.is_empty() {
            error!(token = %Token::from(tok).cut(), "empty password for token");
            continue;
        }
        if tok.len() < MIN_TOKEN_LEN {
            error!(token = %Token::from(tok).cut(), min_length = MIN_TOKEN_LEN, "token too short");
            continue;
        }

        let token = Token::from(tok);
        if passwords.contains_key(&token) {
            warn!(token = %token.cut(), "duplicate token, overwriting previous entry");
        }
        info!(token = %token.cut(), "token password configured");
        passwords.insert(token, pass.to_owned());
    }

    passwords
}

/// Writes the current process id to `path`.
pub fn write_pid(path: &camino::Utf8Path) -> anyhow::Result<()> {
    use anyhow::Context as _;
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("can't create pidfile {path}"))
}

const MAX_BASE_PATH_LEN: usize = 256;

/// Normalizes the routing base path.
///
/// Guarantees on the output: empty, or `/`-rooted with no trailing slash; a
/// path that is over-long, contains `..`, or contains control characters is
/// rejected outright (empty output). A path made only of slashes collapses
/// to `/`, which mounts at the root like the empty path.
pub fn normalize_base_path(base_path: &str) -> String {
    let base_path = base_path.trim();
    if base_path.is_empty() {
        return String::new();
    }

    if base_path.len() > MAX_BASE_PATH_LEN {
        warn!(max = MAX_BASE_PATH_LEN, "base path exceeds maximum length, ignoring");
        return String::new();
    }
    if base_path.contains("..") {
        warn!(base_path, "base path contains path traversal sequence '..', ignoring");
        return String::new();
    }
    if base_path.chars().any(|c| (c as u32) < 32) {
        warn!(base_path, "base path contains control characters, ignoring");
        return String::new();
    }

    let mut normalized = if base_path.starts_with('/') {
        base_path.to_owned()
    } else {
        format!("/{base_path}")
    };

    if normalized.chars().all(|c| c == '/') {
        return "/".to_owned();
    }

    while normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Prefixes a route with the configured base path.
pub fn build_path(base_path: &str, route: &str) -> String {
    if base_path.is_empty() || base_path == "/" {
        return route.to_owned();
    }
    format!("{base_path}{route}")
}

/// Whether `request_path` lies under `base_path` (exactly, or followed by a
/// slash) and should be stripped before routing.
pub fn should_strip_base_path(request_path: &str, base_path: &str) -> bool {
    if base_path.is_empty() || base_path == "/" {
        return false;
    }
    match request_path.strip_prefix(base_path) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}
