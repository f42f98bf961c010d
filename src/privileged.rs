// Copyright Paw Proxy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Component 4.J: acquiring the low-numbered TCP listeners (80, 443) and
//! the DNS socket without requiring the daemon itself to run as root.
//! Prefers a systemd-style socket-activation handoff; falls back to a
//! direct loopback bind.

use socket2::Socket;
use std::net::{TcpListener as StdTcpListener, UdpSocket as StdUdpSocket};
use std::os::fd::{FromRawFd, RawFd};
use tokio::net::{TcpListener, UdpSocket};

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
	#[error("binding 127.0.0.1:{port}: {source}")]
	Bind { port: u16, #[source] source: std::io::Error },
	#[error("inherited fd for {name:?} is not in listening state")]
	NotListening { name: String },
	#[error("inherited fd for {name:?} has no bound port")]
	NoBoundPort { name: String },
	#[error("inherited fd for {name:?} is the wrong socket type")]
	WrongType { name: String },
	#[error("converting inherited fd for {name:?} to a tokio listener: {source}")]
	Convert { name: String, #[source] source: std::io::Error },
}

/// Named sockets the supervisor may hand the daemon at startup, in the
/// order their fds would appear starting at fd 3 if `LISTEN_FDNAMES` is
/// absent (systemd numbers unnamed sockets in listen-socket order).
pub const HTTPS_SOCKET_NAME: &str = "https";
pub const HTTP_SOCKET_NAME: &str = "http";
pub const DNS_SOCKET_NAME: &str = "dns";

/// Reads `LISTEN_PID`/`LISTEN_FDS`/`LISTEN_FDNAMES` once and makes the
/// inherited fds available by name. A no-op (empty) table when the
/// daemon was not socket-activated, or was activated by a different
/// process (`LISTEN_PID` mismatch, e.g. after an exec that didn't clear
/// the environment).
pub struct Activation {
	fds: Vec<(String, RawFd)>,
}

impl Activation {
	pub fn from_env() -> Self {
		let Some(listen_pid) = std::env::var("LISTEN_PID").ok().and_then(|v| v.parse::<u32>().ok())
		else {
			return Self { fds: Vec::new() };
		};
		if listen_pid != std::process::id() {
			return Self { fds: Vec::new() };
		}
		let Some(count) = std::env::var("LISTEN_FDS").ok().and_then(|v| v.parse::<usize>().ok())
		else {
			return Self { fds: Vec::new() };
		};
		let names: Vec<String> = std::env::var("LISTEN_FDNAMES")
			.map(|v| v.split(':').map(str::to_string).collect())
			.unwrap_or_default();

		const FIRST_FD: RawFd = 3;
		let fds = (0..count)
			.map(|i| {
				let name = names.get(i).cloned().unwrap_or_else(|| i.to_string());
				(name, FIRST_FD + i as RawFd)
			})
			.collect();
		Self { fds }
	}

	fn take(&mut self, name: &str) -> Option<RawFd> {
		let idx = self.fds.iter().position(|(n, _)| n == name)?;
		Some(self.fds.remove(idx).1)
	}
}

impl Drop for Activation {
	/// Any inherited fd nobody claimed by name is closed rather than leaked.
	fn drop(&mut self) {
		for (_, fd) in self.fds.drain(..) {
			// SAFETY: fd came from the supervisor's LISTEN_FDS range and was
			// never wrapped in an owning type, so this is the only close.
			unsafe {
				libc::close(fd);
			}
		}
	}
}

/// Acquires a TCP listener for `name`/`port`: an inherited, validated fd
/// if the supervisor passed one, otherwise a direct bind to
/// `127.0.0.1:port`.
pub fn acquire_tcp(activation: &mut Activation, name: &str, port: u16) -> Result<TcpListener, AcquireError> {
	if let Some(fd) = activation.take(name) {
		match validate_tcp_fd(fd, name) {
			Ok(listener) => return Ok(listener),
			Err(e) => {
				// SAFETY: the fd was never wrapped in an owning type above.
				unsafe { libc::close(fd); }
				tracing::warn!(error = %e, socket = name, "discarding unusable inherited fd, binding directly");
			},
		}
	}
	let std_listener =
		StdTcpListener::bind(("127.0.0.1", port)).map_err(|source| AcquireError::Bind { port, source })?;
	std_listener.set_nonblocking(true).map_err(|source| AcquireError::Bind { port, source })?;
	TcpListener::from_std(std_listener).map_err(|source| AcquireError::Convert { name: name.to_string(), source })
}

/// Acquires a UDP socket for `name`/`port` the same way.
pub fn acquire_udp(activation: &mut Activation, name: &str, port: u16) -> Result<UdpSocket, AcquireError> {
	if let Some(fd) = activation.take(name) {
		match validate_udp_fd(fd, name) {
			Ok(socket) => return Ok(socket),
			Err(e) => {
				unsafe { libc::close(fd); }
				tracing::warn!(error = %e, socket = name, "discarding unusable inherited fd, binding directly");
			},
		}
	}
	let std_socket =
		StdUdpSocket::bind(("127.0.0.1", port)).map_err(|source| AcquireError::Bind { port, source })?;
	std_socket.set_nonblocking(true).map_err(|source| AcquireError::Bind { port, source })?;
	UdpSocket::from_std(std_socket).map_err(|source| AcquireError::Convert { name: name.to_string(), source })
}

fn validate_tcp_fd(fd: RawFd, name: &str) -> Result<TcpListener, AcquireError> {
	// SAFETY: fd is a valid, open descriptor from the supervisor's
	// LISTEN_FDS range; `socket2::Socket` takes ownership so it is closed
	// exactly once, either here on validation failure or by the returned
	// listener later.
	let socket = unsafe { Socket::from_raw_fd(fd) };
	if socket.r#type().map(|t| t != socket2::Type::STREAM).unwrap_or(true) {
		socket.into_raw_fd_leak();
		return Err(AcquireError::WrongType { name: name.to_string() });
	}
	// listen() on an already-listening socket is a harmless no-op on every
	// platform this daemon targets; this also catches a non-listening
	// stream socket that was merely bound.
	if socket.listen(1024).is_err() {
		socket.into_raw_fd_leak();
		return Err(AcquireError::NotListening { name: name.to_string() });
	}
	let bound_port = socket
		.local_addr()
		.ok()
		.and_then(|a| a.as_socket())
		.map(|a| a.port())
		.unwrap_or(0);
	if bound_port == 0 {
		socket.into_raw_fd_leak();
		return Err(AcquireError::NoBoundPort { name: name.to_string() });
	}
	socket.set_nonblocking(true).map_err(|source| AcquireError::Convert { name: name.to_string(), source })?;
	let std_listener: StdTcpListener = socket.into();
	TcpListener::from_std(std_listener).map_err(|source| AcquireError::Convert { name: name.to_string(), source })
}

fn validate_udp_fd(fd: RawFd, name: &str) -> Result<UdpSocket, AcquireError> {
	// SAFETY: see `validate_tcp_fd`.
	let socket = unsafe { Socket::from_raw_fd(fd) };
	if socket.r#type().map(|t| t != socket2::Type::DGRAM).unwrap_or(true) {
		socket.into_raw_fd_leak();
		return Err(AcquireError::WrongType { name: name.to_string() });
	}
	let bound_port = socket
		.local_addr()
		.ok()
		.and_then(|a| a.as_socket())
		.map(|a| a.port())
		.unwrap_or(0);
	if bound_port == 0 {
		socket.into_raw_fd_leak();
		return Err(AcquireError::NoBoundPort { name: name.to_string() });
	}
	socket.set_nonblocking(true).map_err(|source| AcquireError::Convert { name: name.to_string(), source })?;
	let std_socket: StdUdpSocket = socket.into();
	UdpSocket::from_std(std_socket).map_err(|source| AcquireError::Convert { name: name.to_string(), source })
}

/// `socket2::Socket` closes its fd on drop; a validation failure path
/// above wants to hand the same fd back to the caller's generic close
/// path instead of double-closing it here.
trait LeakRawFd {
	fn into_raw_fd_leak(self);
}

impl LeakRawFd for Socket {
	fn into_raw_fd_leak(self) {
		std::mem::forget(self);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn no_activation_env_yields_empty_table() {
		// SAFETY: test-only env mutation, single-threaded test.
		unsafe {
			std::env::remove_var("LISTEN_PID");
		}
		let activation = Activation::from_env();
		assert!(activation.fds.is_empty());
	}

	#[test]
	fn mismatched_listen_pid_yields_empty_table() {
		// SAFETY: test-only env mutation, single-threaded test.
		unsafe {
			std::env::set_var("LISTEN_PID", "1");
			std::env::set_var("LISTEN_FDS", "1");
		}
		let activation = Activation::from_env();
		assert!(activation.fds.is_empty());
		// SAFETY: test-only env mutation, single-threaded test.
		unsafe {
			std::env::remove_var("LISTEN_PID");
			std::env::remove_var("LISTEN_FDS");
		}
	}

	#[tokio::test]
	async fn falls_back_to_direct_bind_without_activation() {
		let mut activation = Activation { fds: Vec::new() };
		let listener = acquire_tcp(&mut activation, HTTP_SOCKET_NAME, 0).expect("direct bind succeeds");
		assert!(listener.local_addr().unwrap().port() > 0);
	}
}
