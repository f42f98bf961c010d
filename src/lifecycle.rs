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

//! Component 4.K: wires every other component into a running daemon and
//! back out again. Construction is fallible and synchronous; `run` drives
//! the independent server tasks until either one fails or shutdown is
//! requested; shutdown tears them down in a fixed order under a deadline.

use crate::certs::{CertCache, CertificateAuthority};
use crate::config::Config;
use crate::control_api::{self, ApiState};
use crate::metrics::MetricsStore;
use crate::privileged::{self, Activation};
use crate::proxy::{self, ProxyState};
use crate::registry::Registry;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

pub struct Daemon {
	config: Config,
	registry: Arc<Registry>,
	metrics: Arc<MetricsStore>,
	cert_cache: Arc<CertCache>,
	shutdown: CancellationToken,
}

impl Daemon {
	/// Ensures the support directory exists (mode 0o700), loads the root CA
	/// (fatal if missing), and constructs every in-process component. No
	/// sockets are bound yet; that happens in [`Daemon::run`].
	pub fn construct(config: Config) -> anyhow::Result<Self> {
		ensure_support_dir(&config.support_dir)?;
		let ca = CertificateAuthority::load(&config.ca_cert_path(), &config.ca_key_path())?;
		let cert_cache = Arc::new(CertCache::new(ca, config.tld.clone(), config.cert_cache_cap));
		let registry = Arc::new(Registry::new(config.route_ttl(), config.route_cap));
		let metrics = Arc::new(MetricsStore::new(config.metrics_cap));
		Ok(Self { config, registry, metrics, cert_cache, shutdown: CancellationToken::new() })
	}

	/// Spawns DNS, API, HTTP redirect, HTTPS and the cleanup reaper as
	/// independent tasks. Returns once the shutdown token is cancelled or
	/// any task exits with an error, whichever happens first; in the
	/// latter case all other tasks are cancelled before returning.
	pub async fn run(&self, version: &'static str) -> anyhow::Result<()> {
		let mut activation = Activation::from_env();
		let https_listener =
			privileged::acquire_tcp(&mut activation, privileged::HTTPS_SOCKET_NAME, 443)?;
		let http_listener = privileged::acquire_tcp(&mut activation, privileged::HTTP_SOCKET_NAME, 80)?;
		drop(activation);

		let proxy_state = Arc::new(ProxyState::new(
			self.registry.clone(),
			self.metrics.clone(),
			self.cert_cache.clone(),
			version,
			self.config.tld.clone(),
			&self.config.dashboard_host,
		));
		let api_state =
			ApiState::new(self.registry.clone(), self.metrics.clone(), version, &self.config.rate_limits);
		let api_socket_path = self.config.control_socket_path();
		let api_listener = control_api::bind_socket(&api_socket_path)?;

		let tls_config = build_tls_config(self.cert_cache.clone())?;
		let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

		let mut tasks = JoinSet::new();

		tasks.spawn({
			let shutdown = self.shutdown.child_token();
			let tld = self.config.tld.clone();
			let dns_port = self.config.dns_port;
			async move {
				let addr = SocketAddr::from(([127, 0, 0, 1], dns_port));
				paw_dns::serve(addr, &tld, shutdown.cancelled_owned()).await.map_err(anyhow::Error::from)
			}
		});

		tasks.spawn({
			let shutdown = self.shutdown.child_token();
			let router = control_api::router(api_state);
			async move {
				let result = axum::serve(api_listener, router)
					.with_graceful_shutdown(shutdown.cancelled_owned())
					.await;
				let _ = std::fs::remove_file(&api_socket_path);
				result.map_err(anyhow::Error::from)
			}
		});

		tasks.spawn({
			let shutdown = self.shutdown.child_token();
			let registry = self.registry.clone();
			async move {
				let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
				loop {
					tokio::select! {
						_ = ticker.tick() => registry.cleanup(),
						_ = shutdown.cancelled() => return Ok::<(), anyhow::Error>(()),
					}
				}
			}
		});

		tasks.spawn({
			let shutdown = self.shutdown.child_token();
			let tld = self.config.tld.clone();
			async move { serve_http_redirect(http_listener, tld, shutdown).await }
		});

		tasks.spawn({
			let shutdown = self.shutdown.child_token();
			async move { serve_https(https_listener, tls_acceptor, proxy_state, shutdown).await }
		});

		let outcome: Result<anyhow::Result<()>, tokio::task::JoinError> = tokio::select! {
			Some(result) = tasks.join_next() => result,
			_ = self.shutdown.cancelled() => {
				info!("shutdown requested");
				Ok(Ok(()))
			}
		};

		self.shutdown.cancel();
		let shutdown_result = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
			while tasks.join_next().await.is_some() {}
		})
		.await;
		if shutdown_result.is_err() {
			warn!("graceful shutdown deadline exceeded, aborting remaining tasks");
			tasks.abort_all();
		}
		let _ = std::fs::remove_file(self.config.control_socket_path());

		match outcome {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(e),
			Err(join_err) => Err(anyhow::anyhow!("server task panicked: {join_err}")),
		}
	}

	pub fn shutdown_handle(&self) -> CancellationToken {
		self.shutdown.clone()
	}
}

#[cfg(unix)]
fn ensure_support_dir(dir: &std::path::Path) -> anyhow::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::create_dir_all(dir)?;
	std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
	Ok(())
}

#[cfg(not(unix))]
fn ensure_support_dir(dir: &std::path::Path) -> anyhow::Result<()> {
	std::fs::create_dir_all(dir)?;
	Ok(())
}

fn build_tls_config(cert_cache: Arc<CertCache>) -> anyhow::Result<rustls::ServerConfig> {
	let mut config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
		.with_no_client_auth()
		.with_cert_resolver(cert_cache);
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(config)
}

async fn serve_https(
	listener: TcpListener,
	acceptor: tokio_rustls::TlsAcceptor,
	state: Arc<ProxyState>,
	shutdown: CancellationToken,
) -> anyhow::Result<()> {
	let mut connections = JoinSet::new();
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer_addr) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "https accept failed");
						continue;
					},
				};
				let acceptor = acceptor.clone();
				let state = state.clone();
				let conn_shutdown = shutdown.child_token();
				connections.spawn(async move {
					let tls_stream = match acceptor.accept(stream).await {
						Ok(s) => s,
						Err(e) => {
							warn!(error = %e, %peer_addr, "tls handshake failed");
							return;
						},
					};
					let io = TokioIo::new(tls_stream);
					let server = auto::Builder::new(TokioExecutor::new());
					let service = hyper::service::service_fn(move |req| {
						let state = state.clone();
						async move { Ok::<_, std::convert::Infallible>(proxy::handle(state, req, peer_addr).await) }
					});
					let conn = server.serve_connection_with_upgrades(io, service);
					tokio::select! {
						result = conn => {
							if let Err(e) = result {
								warn!(error = %e, %peer_addr, "https connection ended with an error");
							}
						}
						_ = conn_shutdown.cancelled() => {}
					}
				});
			}
			_ = shutdown.cancelled() => {
				while connections.join_next().await.is_some() {}
				state.tasks.close();
				state.tasks.wait().await;
				return Ok(());
			}
		}
	}
}

async fn serve_http_redirect(
	listener: TcpListener,
	tld: String,
	shutdown: CancellationToken,
) -> anyhow::Result<()> {
	let mut connections = JoinSet::new();
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer_addr) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "http accept failed");
						continue;
					},
				};
				let tld = tld.clone();
				connections.spawn(async move {
					let io = TokioIo::new(stream);
					let service = hyper::service::service_fn(move |req| {
						let tld = tld.clone();
						async move { Ok::<_, std::convert::Infallible>(proxy::handle_redirect(tld, req).await) }
					});
					if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
						warn!(error = %e, %peer_addr, "http redirect connection ended with an error");
					}
				});
			}
			_ = shutdown.cancelled() => {
				while connections.join_next().await.is_some() {}
				return Ok(());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shutdown_handle_is_cancellable_independent_of_run() {
		let token = CancellationToken::new();
		assert!(!token.is_cancelled());
		token.cancel();
		assert!(token.is_cancelled());
	}

	#[tokio::test]
	async fn ensure_support_dir_sets_restrictive_mode() {
		let dir = std::env::temp_dir().join(format!("paw-proxy-test-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		ensure_support_dir(&dir).unwrap();
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
			assert_eq!(mode, 0o700);
		}
		let _ = std::fs::remove_dir_all(&dir);
	}
}
