//! Host identity reported with every metadata record.

use std::net::UdpSocket;

#[derive(Debug, Clone)]
pub struct HostInfo {
    pub hostname: String,
    pub ip_address: String,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into()),
            ip_address: primary_ip(),
        }
    }
}

/// Determine the primary outbound IP by "connecting" a UDP socket to a
/// public address; nothing is sent, the kernel just picks the route.
fn primary_ip() -> String {
    let fallback = || "127.0.0.1".to_string();
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return fallback();
    };
    if socket.connect("8.8.8.8:80").is_err() {
        return fallback();
    }
    socket
        .local_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| fallback())
}
