//! Upstream routing targets and `host:port` helpers.

use std::net::SocketAddr;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Splits `host:port` or `[v6]:port`. Returns `None` when no port is present,
/// including bare IPv6 literals.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return (!port.is_empty()).then_some((host, port));
    }
    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') || port.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Joins a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Host part of a `host:port` string, or the whole string when it has no port.
pub fn strip_port(addr: &str) -> &str {
    match split_host_port(addr) {
        Some((host, _)) => host,
        None => addr.trim_start_matches('[').trim_end_matches(']'),
    }
}

/// Target for the HTTP path: the `Host` value, with port 80 added if missing.
pub fn http_target(host: &str) -> String {
    if split_host_port(host).is_some() {
        return host.to_string();
    }
    join_host_port(strip_port(host), DEFAULT_HTTP_PORT)
}

/// Target for the TLS path.
///
/// Without SNI the original destination is used whole. With SNI the name is
/// paired with the original destination's port, or 443 if that is missing.
pub fn tls_target(sni: Option<&str>, original: Option<SocketAddr>) -> Option<String> {
    match sni.filter(|s| !s.is_empty()) {
        None => original.map(|addr| addr.to_string()),
        Some(name) if split_host_port(name).is_some() => Some(name.to_string()),
        Some(name) => {
            let port = original
                .map(|addr| addr.port())
                .filter(|&p| p != 0)
                .unwrap_or(DEFAULT_TLS_PORT);
            Some(join_host_port(name, port))
        }
    }
}
