//! Loopback-address semantics shared by the upstream validator (anti-SSRF
//! guard), the proxy's dialer (defense-in-depth re-check), and the launcher's
//! free-port probe.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// True if `ip` is loopback under the rules this daemon accepts upstreams
/// from: 127.0.0.0/8, ::1, or an IPv4-mapped loopback address.
pub fn is_loopback_ip(ip: &IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => v4.is_loopback(),
		IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
	}
}

/// Splits a `host:port` pair and reports whether the host is the literal
/// `localhost` or parses to a loopback IP (bracketed IPv6 is accepted).
/// Non-loopback addresses, including `0.0.0.0` and any externally routable
/// address, are rejected by returning `false`.
pub fn host_is_loopback(host: &str) -> bool {
	if host.eq_ignore_ascii_case("localhost") {
		return true;
	}
	let trimmed = host.strip_prefix('[').and_then(|h| h.strip_suffix(']'));
	let candidate = trimmed.unwrap_or(host);
	candidate
		.parse::<IpAddr>()
		.map(|ip| is_loopback_ip(&ip))
		.unwrap_or(false)
}

/// Splits `host:port` into its parts without resolving DNS. Returns `None`
/// if there isn't exactly one unbracketed colon (for IPv4/hostname) or a
/// bracketed IPv6 host followed by `:port`.
pub fn split_host_port(hostport: &str) -> Option<(&str, &str)> {
	if let Some(rest) = hostport.strip_prefix('[') {
		let (host, rest) = rest.split_once(']')?;
		let port = rest.strip_prefix(':')?;
		return Some((host, port));
	}
	hostport.rsplit_once(':')
}

pub const LOOPBACK_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
pub const LOOPBACK_V6: Ipv6Addr = Ipv6Addr::LOCALHOST;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_loopback_forms() {
		assert!(host_is_loopback("localhost"));
		assert!(host_is_loopback("127.0.0.1"));
		assert!(host_is_loopback("127.0.0.42"));
		assert!(host_is_loopback("::1"));
		assert!(host_is_loopback("[::1]"));
	}

	#[test]
	fn rejects_non_loopback_forms() {
		assert!(!host_is_loopback("0.0.0.0"));
		assert!(!host_is_loopback("::2"));
		assert!(!host_is_loopback("10.0.0.1"));
		assert!(!host_is_loopback("example.com"));
		assert!(!host_is_loopback("8.8.8.8"));
	}

	#[test]
	fn splits_host_port_forms() {
		assert_eq!(split_host_port("localhost:3000"), Some(("localhost", "3000")));
		assert_eq!(split_host_port("[::1]:3000"), Some(("::1", "3000")));
		assert_eq!(split_host_port("127.0.0.1:3000"), Some(("127.0.0.1", "3000")));
		assert_eq!(split_host_port("no-port"), None);
	}
}
