//! Port availability checks.

use std::net::TcpListener;

/// First port tried by port discovery.
pub const DEFAULT_SERVER_PORT: u16 = 5005;

/// Whether a TCP port can be bound on a host.
pub fn is_port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Find the first available port on a host, scanning upwards from `start`.
pub fn find_available_port(host: &str, start: u16) -> Option<u16> {
    (start.max(1)..=u16::MAX).find(|port| is_port_available(host, *port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available("127.0.0.1", port));
        drop(listener);
        assert!(is_port_available("127.0.0.1", port));
    }

    #[test]
    fn skips_ports_in_use() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let found = find_available_port("127.0.0.1", port).unwrap();
        assert!(found > port);
    }

    #[test]
    fn never_returns_port_zero() {
        assert!(find_available_port("127.0.0.1", 0).unwrap() > 0);
    }
}
