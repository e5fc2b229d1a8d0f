use std::io;
use std::net::IpAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::endpoint::{strip_brackets, ConfigError, Endpoint, ProxyEndpoint};
use crate::head::read_head;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy in environment: {0}")]
    Environment(#[from] ConfigError),

    #[error("proxy refused CONNECT to {target}: {status}")]
    Rejected { target: String, status: String },

    #[error("malformed proxy response: {0}")]
    MalformedResponse(String),

    #[error("proxy tunnel I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// How the dialer picks a forward proxy.
#[derive(Debug, Clone, Default)]
pub enum ProxyPolicy {
    /// Always tunnel through this proxy.
    Explicit(ProxyEndpoint),
    /// Consult `HTTP_PROXY` / `HTTPS_PROXY` / `NO_PROXY` for every dial.
    #[default]
    Environment,
}

impl ProxyPolicy {
    /// The proxy to use for `target`, if any.
    pub fn resolve(&self, target: &Endpoint) -> Result<Option<ProxyEndpoint>, ProxyError> {
        match self {
            ProxyPolicy::Explicit(proxy) => Ok(Some(proxy.clone())),
            ProxyPolicy::Environment => Ok(EnvProxy::from_env().proxy_for(target)?),
        }
    }
}

/// Proxy settings read from the conventional environment variables.
///
/// Upper-case names win over lower-case ones, empty values count as unset.
#[derive(Debug, Clone, Default)]
pub struct EnvProxy {
    http: Option<String>,
    https: Option<String>,
    no_proxy: Option<String>,
}

impl EnvProxy {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |upper: &str, lower: &str| {
            lookup(upper)
                .filter(|v| !v.is_empty())
                .or_else(|| lookup(lower).filter(|v| !v.is_empty()))
        };
        Self {
            http: get("HTTP_PROXY", "http_proxy"),
            https: get("HTTPS_PROXY", "https_proxy"),
            no_proxy: get("NO_PROXY", "no_proxy"),
        }
    }

    pub fn proxy_for(&self, target: &Endpoint) -> Result<Option<ProxyEndpoint>, ConfigError> {
        let configured = if target.is_secure() {
            self.https.as_deref()
        } else {
            self.http.as_deref()
        };
        let Some(raw) = configured else {
            return Ok(None);
        };
        if !self.use_proxy(target) {
            return Ok(None);
        }
        ProxyEndpoint::parse(raw).map(Some)
    }

    fn use_proxy(&self, target: &Endpoint) -> bool {
        let host = strip_brackets(target.host()).to_ascii_lowercase();
        if host == "localhost" {
            return false;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            if ip.is_loopback() {
                return false;
            }
        }

        let Some(no_proxy) = self.no_proxy.as_deref() else {
            return true;
        };
        !no_proxy
            .split(',')
            .map(|entry| entry.trim().to_ascii_lowercase())
            .filter(|entry| !entry.is_empty())
            .any(|entry| no_proxy_matches(&entry, &host, target.port()))
    }
}

/// Whether one `NO_PROXY` entry excludes `host:port`.
///
/// `*` matches everything, `example.com` matches the name and its
/// subdomains, `.example.com` matches subdomains only, and a `:port` suffix
/// restricts the entry to that port.
fn no_proxy_matches(entry: &str, host: &str, port: u16) -> bool {
    if entry == "*" {
        return true;
    }

    let (pattern, entry_port) = split_entry_port(entry);
    if let Some(entry_port) = entry_port {
        if entry_port != port {
            return false;
        }
    }
    let pattern = strip_brackets(pattern);

    if pattern.starts_with('.') {
        return host.ends_with(pattern);
    }
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

fn split_entry_port(entry: &str) -> (&str, Option<u16>) {
    // Bare IPv6 literals contain colons but no port.
    if entry.parse::<IpAddr>().is_ok() {
        return (entry, None);
    }
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (entry, None),
        },
        _ => (entry, None),
    }
}

/// Open an HTTP `CONNECT` tunnel to `target` over an established connection
/// to `proxy`.
///
/// The response header is read byte by byte so nothing beyond it is taken off
/// the stream; after a 2xx answer the stream carries the tunnel.
pub async fn connect_tunnel<S>(
    stream: &mut S,
    proxy: &ProxyEndpoint,
    target: &Endpoint,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = target.authority();
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(credentials) = proxy.credentials() {
        request.push_str(&format!(
            "Proxy-Authorization: {}\r\n",
            credentials.basic_auth()
        ));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let header = read_head(stream).await.map_err(|err| match err.kind() {
        io::ErrorKind::InvalidData => ProxyError::MalformedResponse(err.to_string()),
        _ => ProxyError::Io(err),
    })?;
    let status_line = header.lines().next().unwrap_or_default();
    let code = parse_status_code(status_line)
        .ok_or_else(|| ProxyError::MalformedResponse(status_line.to_string()))?;

    if !(200..300).contains(&code) {
        return Err(ProxyError::Rejected {
            target: authority,
            status: status_line
                .split_once(' ')
                .map(|(_, status)| status.to_string())
                .unwrap_or_default(),
        });
    }

    debug!(proxy = %proxy, target = %authority, "proxy tunnel established");
    Ok(())
}

fn parse_status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
