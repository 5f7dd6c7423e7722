//! Local address discovery.

use std::net::{IpAddr, UdpSocket};
use std::sync::OnceLock;

static LOCAL_IPV4: OnceLock<String> = OnceLock::new();

/// The machine's non-loopback IPv4 address, probed once per process.
///
/// Returns an empty string when the host has no usable interface; callers
/// registering with a `:port` address then advertise the bare port and the
/// operator is expected to fix the deployment.
pub fn local_ipv4() -> &'static str {
    LOCAL_IPV4.get_or_init(|| probe_local_ipv4().unwrap_or_default())
}

fn probe_local_ipv4() -> Option<String> {
    // Route probe: connect() on a UDP socket selects the outbound
    // interface without sending a packet.
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip.to_string()),
        _ => None,
    }
}

/// Expands a `:port` listen address into `host:port` using the local IPv4,
/// so the advertised provider address is dialable from other machines.
pub fn expand_addr(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix(':') {
        format!("{}:{}", local_ipv4(), rest)
    } else {
        addr.to_string()
    }
}
