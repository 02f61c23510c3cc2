// src/ipv6.rs
use std::net::Ipv6Addr;

/// Wraps a bare IPv6 literal in `[...]` so it can be embedded in a URL or a
/// `host:port` forwarding target. Hostnames and IPv4 literals pass through
/// unchanged.
pub fn wrap_host(host: &str) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Builds a `host:port` string, bracketing the host first if it is IPv6.
pub fn host_port(host: &str, port: u16) -> String {
    format!("{}:{}", wrap_host(host), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_ipv6_literal() {
        assert_eq!(wrap_host("::1"), "[::1]");
        assert_eq!(wrap_host("2001:db8::1"), "[2001:db8::1]");
    }

    #[test]
    fn leaves_ipv4_and_hostnames_unwrapped() {
        assert_eq!(wrap_host("10.0.0.1"), "10.0.0.1");
        assert_eq!(wrap_host("api.cluster.local"), "api.cluster.local");
    }

    #[test]
    fn host_port_embeds_bracketed_ipv6() {
        assert_eq!(host_port("::1", 6443), "[::1]:6443");
        assert_eq!(host_port("10.0.0.1", 6443), "10.0.0.1:6443");
    }

    #[test]
    fn wrapped_host_parses_in_a_url() {
        for host in ["10.0.0.1", "::1", "fd00::2", "api.internal"] {
            let url = format!("https://{}:6443/readyz", wrap_host(host));
            assert!(url::Url::parse(&url).is_ok(), "failed to parse {url}");
        }
    }
}
