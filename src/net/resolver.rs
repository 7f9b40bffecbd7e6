//! Host name resolution for outbound connections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::lookup_host;

use crate::error::{Result, SessionError};

/// Resolve `"host:port"` (or `"[v6]:port"`) to a single address.
pub async fn resolve(host_port: &str) -> Result<SocketAddr> {
    if let Ok(addr) = host_port.parse::<SocketAddr>() {
        return Ok(normalize(addr));
    }

    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| SessionError::InvalidAddress(host_port.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| SessionError::InvalidAddress(host_port.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(SessionError::InvalidAddress(host_port.to_string()));
    }

    resolve_host(host, port).await
}

/// Resolve `host` and pair it with `port`. IPv4 results are preferred.
pub async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(normalize(SocketAddr::new(ip, port)));
    }

    let candidates: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|_| SessionError::UnresolvedHost(host.to_string()))?
        .collect();

    let chosen = candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| SessionError::UnresolvedHost(host.to_string()))?;

    tracing::debug!(host, resolved = %chosen, "Host resolved");
    Ok(normalize(chosen))
}

// IPv6 loopback is mapped onto IPv4 loopback.
fn normalize(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(ip) if ip.is_loopback() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literals_short_circuit() {
        let addr = resolve("10.1.2.3:80").await.unwrap();
        assert_eq!(addr, "10.1.2.3:80".parse().unwrap());
    }

    #[tokio::test]
    async fn ipv6_loopback_maps_to_ipv4() {
        assert_eq!(resolve("[::1]:9000").await.unwrap(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(resolve_host("::1", 1).await.unwrap(), "127.0.0.1:1".parse().unwrap());
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let addr = resolve("localhost:7420").await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 7420);
    }

    #[tokio::test]
    async fn malformed_input() {
        assert!(matches!(resolve("no-port").await, Err(SessionError::InvalidAddress(_))));
        assert!(matches!(resolve("host:http").await, Err(SessionError::InvalidAddress(_))));
        assert!(matches!(resolve(":80").await, Err(SessionError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn unknown_host() {
        let result = resolve_host("does-not-exist.invalid", 80).await;
        assert!(matches!(result, Err(SessionError::UnresolvedHost(_))));
    }
}
