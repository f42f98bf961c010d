//! Component 4.B: input validation for everything that crosses the control
//! API boundary. Each function is `&str -> Result<(), ValidationError>` so
//! callers can validate fields independently and report exactly which one
//! failed.

use crate::net;
use once_cell_lite::route_name_re;
use std::path::Path;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
	#[error("route name must match ^[A-Za-z][A-Za-z0-9._-]{{0,62}}$")]
	InvalidName,
	#[error("upstream host must be localhost or a loopback address")]
	NonLoopbackUpstream,
	#[error("upstream must be host:port with port in 1..=65535")]
	MalformedUpstream,
	#[error("dir must be a non-empty, absolute, canonically-normalized path")]
	InvalidDir,
}

/// `^[A-Za-z][A-Za-z0-9._-]{0,62}$` — at most 63 bytes total.
pub fn validate_route_name(name: &str) -> Result<(), ValidationError> {
	if name.is_empty() || name.len() > 63 {
		return Err(ValidationError::InvalidName);
	}
	if route_name_re().is_match(name) {
		Ok(())
	} else {
		Err(ValidationError::InvalidName)
	}
}

/// Rejects anything that is not `localhost:<port>` or `<loopback-ip>:<port>`.
/// This is the anti-SSRF guard: registering a route must never let the proxy
/// be pointed at a non-loopback address, however it is spelled (decimal,
/// hex/octal IP forms all fail to parse as `IpAddr` and are rejected here).
pub fn validate_upstream(upstream: &str) -> Result<(), ValidationError> {
	let (host, port) = net::split_host_port(upstream).ok_or(ValidationError::MalformedUpstream)?;
	let port: u32 = port.parse().map_err(|_| ValidationError::MalformedUpstream)?;
	if port == 0 || port > 65535 {
		return Err(ValidationError::MalformedUpstream);
	}
	if !net::host_is_loopback(host) {
		return Err(ValidationError::NonLoopbackUpstream);
	}
	Ok(())
}

/// Must be non-empty, absolute, and byte-for-byte equal to its
/// lexically-normalized form (no `.`/`..` segments, no redundant
/// separators, no trailing separator except the root itself).
pub fn validate_dir(dir: &str) -> Result<(), ValidationError> {
	if dir.is_empty() {
		return Err(ValidationError::InvalidDir);
	}
	let path = Path::new(dir);
	if !path.is_absolute() {
		return Err(ValidationError::InvalidDir);
	}
	if dir != normalize(dir) {
		return Err(ValidationError::InvalidDir);
	}
	Ok(())
}

/// Lexical (non-filesystem-touching) path normalization: collapses `.`
/// segments, rejects `..` by leaving them in place (so the subsequent
/// equality check fails), and removes redundant/trailing separators.
fn normalize(dir: &str) -> String {
	let mut parts: Vec<&str> = Vec::new();
	for seg in dir.split('/') {
		match seg {
			"" | "." => continue,
			seg => parts.push(seg),
		}
	}
	format!("/{}", parts.join("/"))
}

/// Lazily-compiled regex, kept out of `validate.rs` proper so the compile
/// cost is paid once regardless of how many validations run.
mod once_cell_lite {
	use once_cell::sync::Lazy;
	use regex::Regex;

	static ROUTE_NAME: Lazy<Regex> =
		Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._-]{0,62}$").expect("static regex compiles"));

	pub fn route_name_re() -> &'static Regex {
		&ROUTE_NAME
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn name_length_boundary() {
		let name_63 = "a".repeat(63);
		let name_64 = "a".repeat(64);
		assert!(validate_route_name(&name_63).is_ok());
		assert!(validate_route_name(&name_64).is_err());
	}

	#[test]
	fn name_allows_dots_for_multi_level() {
		assert!(validate_route_name("service.project").is_ok());
	}

	#[test]
	fn name_rejects_bad_first_char() {
		assert!(validate_route_name("1app").is_err());
		assert!(validate_route_name("").is_err());
		assert!(validate_route_name("-app").is_err());
	}

	#[test]
	fn upstream_port_boundaries() {
		assert!(validate_upstream("localhost:0").is_err());
		assert!(validate_upstream("localhost:65535").is_ok());
		assert!(validate_upstream("localhost:65536").is_err());
	}

	#[test]
	fn upstream_loopback_forms() {
		assert!(validate_upstream("localhost:3000").is_ok());
		assert!(validate_upstream("127.0.0.1:3000").is_ok());
		assert!(validate_upstream("127.0.0.42:3000").is_ok());
		assert!(validate_upstream("[::1]:3000").is_ok());
		assert_eq!(
			validate_upstream("[::2]:3000"),
			Err(ValidationError::NonLoopbackUpstream)
		);
		assert_eq!(
			validate_upstream("0.0.0.0:3000"),
			Err(ValidationError::NonLoopbackUpstream)
		);
		assert_eq!(
			validate_upstream("evil.example.com:3000"),
			Err(ValidationError::NonLoopbackUpstream)
		);
	}

	#[test]
	fn dir_must_be_absolute_and_normalized() {
		assert!(validate_dir("/tmp/x").is_ok());
		assert!(validate_dir("relative/path").is_err());
		assert!(validate_dir("/tmp/../etc").is_err());
		assert!(validate_dir("/tmp//x").is_err());
		assert!(validate_dir("/tmp/x/").is_err());
		assert!(validate_dir("").is_err());
	}
}
