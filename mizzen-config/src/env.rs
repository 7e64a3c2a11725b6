//! Bind and registry address resolution
//!
//! Host resolution walks a fixed priority chain: per-protocol environment
//! variable, global environment variable, configured host, a UDP-probe
//! toward the registry to learn the outbound interface, then loopback.
//! Registry-facing addresses may differ from bind addresses (containers,
//! NAT), so both sets of variables exist.

use mizzen_core::Url;
use std::net::UdpSocket;
use tracing::debug;

pub const IP_TO_BIND: &str = "MIZZEN_IP_TO_BIND";
pub const PORT_TO_BIND: &str = "MIZZEN_PORT_TO_BIND";
pub const IP_TO_REGISTRY: &str = "MIZZEN_IP_TO_REGISTRY";
pub const PORT_TO_REGISTRY: &str = "MIZZEN_PORT_TO_REGISTRY";

fn protocol_scoped(protocol: &str, key: &str) -> String {
    format!("{}_{}", protocol.to_uppercase(), key)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn is_usable_host(host: &str) -> bool {
    !host.is_empty() && host != "localhost" && host != "0.0.0.0" && host != "127.0.0.1"
}

/// Learn the local address the OS would use to reach the registry
fn probe_local_host(registries: &[Url]) -> Option<String> {
    for registry in registries {
        if registry.port() == 0 {
            continue;
        }
        let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else { continue };
        if socket.connect((registry.host(), registry.port())).is_ok() {
            if let Ok(local) = socket.local_addr() {
                let host = local.ip().to_string();
                if is_usable_host(&host) {
                    debug!("probed local host {} via registry {}", host, registry.address());
                    return Some(host);
                }
            }
        }
    }
    None
}

/// Bind host for one protocol, by priority: `{PROTO}_MIZZEN_IP_TO_BIND` >
/// `MIZZEN_IP_TO_BIND` > configured > registry probe > loopback
pub fn resolve_bind_host(
    protocol: &str,
    configured: Option<&str>,
    registries: &[Url],
) -> String {
    if let Some(host) = env_var(&protocol_scoped(protocol, IP_TO_BIND)) {
        return host;
    }
    if let Some(host) = env_var(IP_TO_BIND) {
        return host;
    }
    if let Some(configured) = configured.filter(|h| !h.is_empty()) {
        return configured.to_string();
    }
    probe_local_host(registries).unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Bind port: environment > configured > protocol default; a zero result
/// falls back to a free ephemeral port
pub fn resolve_bind_port(protocol: &str, configured: Option<u16>, default: u16) -> u16 {
    let from_env = env_var(&protocol_scoped(protocol, PORT_TO_BIND))
        .or_else(|| env_var(PORT_TO_BIND))
        .and_then(|p| p.parse().ok());
    let port = from_env.or(configured).unwrap_or(default);
    if port != 0 {
        return port;
    }
    random_free_port()
}

/// The address published at the registry may differ from the bind address
pub fn resolve_registry_host(protocol: &str, bind_host: &str) -> String {
    env_var(&protocol_scoped(protocol, IP_TO_REGISTRY))
        .or_else(|| env_var(IP_TO_REGISTRY))
        .unwrap_or_else(|| bind_host.to_string())
}

pub fn resolve_registry_port(protocol: &str, bind_port: u16) -> u16 {
    env_var(&protocol_scoped(protocol, PORT_TO_REGISTRY))
        .or_else(|| env_var(PORT_TO_REGISTRY))
        .and_then(|p| p.parse().ok())
        .unwrap_or(bind_port)
}

fn random_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap_or(0)
}
