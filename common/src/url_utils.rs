use std::net::SocketAddr;

use anyhow::anyhow;
use url::Url;

pub fn direct_url(ip: &str, port: &str) -> String {
    format!("http://{ip}:{port}")
}

pub fn parse_socket_addr(s: &str) -> anyhow::Result<SocketAddr> {
    s.parse()
        .map_err(|e| anyhow!("invalid listen address {s:?}: {e}"))
}

/// Validate and normalize a peer URL; only http(s), no control characters.
pub fn sanitize_url(url: &str) -> anyhow::Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(anyhow!("URL cannot be empty"));
    }
    if url.contains('\0') || url.contains('\r') || url.contains('\n') {
        return Err(anyhow!("URL contains invalid control characters"));
    }
    let parsed = Url::parse(url).map_err(|e| anyhow!("invalid URL format: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("unsupported URL scheme: {other}")),
    }
    Ok(parsed.to_string().trim_end_matches('/').to_string())
}

/// Split an http(s) URL into (host, port) for seeding a DaemonInfo hint.
pub fn split_host_port(url: &str) -> anyhow::Result<(String, String)> {
    let parsed = Url::parse(url).map_err(|e| anyhow!("invalid URL format: {e}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("URL {url:?} has no host"))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| anyhow!("URL {url:?} has no port"))?
        .to_string();
    Ok((host, port))
}
