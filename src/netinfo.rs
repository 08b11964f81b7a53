//! Local-address discovery collaborator.

use std::net::UdpSocket;

/// Fallback address used when discovery fails.
pub const FALLBACK_ADDR: &str = "127.0.0.1";

/// Best-effort discovery of a non-loopback IPv4 address for this host.
///
/// Opens a UDP socket and "connects" it to a well-known public address
/// without sending any traffic; the kernel picks the local address that
/// would be used to reach it, which is the address we report. Falls back to
/// [`FALLBACK_ADDR`] if discovery fails for any reason (no route, no
/// non-loopback interface, sandboxed network namespace, ...).
pub fn discover_self_addr() -> String {
    try_discover_self_addr().unwrap_or_else(|| FALLBACK_ADDR.to_string())
}

fn try_discover_self_addr() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    let ip = addr.ip();
    if ip.is_loopback() {
        return None;
    }
    Some(ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn discover_self_addr_never_panics_and_is_well_formed() {
        let addr = discover_self_addr();
        assert!(addr.parse::<Ipv4Addr>().is_ok());
    }
}
