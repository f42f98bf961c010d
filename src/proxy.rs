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

//! Component 4.H: the TLS-terminating reverse proxy. This is the busiest
//! module in the crate — host-based dispatch, header hygiene, a loopback
//! dialer with a small connection pool, WebSocket hijack, and the
//! metrics hook that every response (matched or not) runs through.

use crate::certs::CertCache;
use crate::dashboard::DashboardState;
use crate::metrics::{MetricsEntry, MetricsStore};
use crate::registry::{Registry, host_to_name};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::warn;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const WEBSOCKET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const POOL_MAX_IDLE: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const HOP_BY_HOP: &[&str] = [
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
]
.as_slice();

pub struct ProxyState {
	pub registry: Arc<Registry>,
	pub metrics: Arc<MetricsStore>,
	pub dashboard: axum::Router,
	pub dashboard_fqdn: String,
	pub tld: String,
	pool: Mutex<std::collections::HashMap<String, VecDeque<PooledConn>>>,
	/// Tracks detached per-connection work that outlives the HTTP server
	/// future that spawned it (currently: WebSocket relay loops started
	/// after the upgrade handshake completes). `serve_https` closes and
	/// drains this on shutdown so a live WebSocket session can't outlive
	/// the daemon's shutdown deadline unnoticed.
	pub tasks: TaskTracker,
}

struct PooledConn {
	sender: hyper::client::conn::http1::SendRequest<Incoming>,
	idle_since: Instant,
}

impl ProxyState {
	pub fn new(
		registry: Arc<Registry>,
		metrics: Arc<MetricsStore>,
		cert_cache: Arc<CertCache>,
		version: &'static str,
		tld: impl Into<String>,
		dashboard_host: &str,
	) -> Self {
		let tld = tld.into();
		let dashboard_fqdn = format!("{dashboard_host}.{tld}");
		let dashboard = crate::dashboard::router(DashboardState {
			registry: registry.clone(),
			metrics: metrics.clone(),
			version,
		});
		let _ = cert_cache; // held by the TLS acceptor, not the request path
		Self {
			registry,
			metrics,
			dashboard,
			dashboard_fqdn,
			tld,
			pool: Mutex::new(Default::default()),
			tasks: TaskTracker::new(),
		}
	}
}

fn host_header(req: &Request<Incoming>) -> Option<String> {
	req.headers().get(axum::http::header::HOST)?.to_str().ok().map(|h| h.to_string())
}

fn strip_port(host: &str) -> &str {
	paw_core::net::split_host_port(host).map(|(h, _)| h).unwrap_or(host)
}

fn html_escape(s: &str) -> String {
	s.replace('&', "&amp;")
		.replace('<', "&lt;")
		.replace('>', "&gt;")
		.replace('"', "&quot;")
}

fn error_page(title: &str, detail: &str, refresh: bool) -> Body {
	let refresh_tag =
		if refresh { r#"<meta http-equiv="refresh" content="2">"# } else { "" };
	Body::from(format!(
		"<!DOCTYPE html><html><head><meta charset=\"utf-8\">{refresh_tag}<title>{title}</title></head>\
		 <body><h1>{title}</h1><p>{detail}</p></body></html>",
		title = html_escape(title),
		detail = html_escape(detail),
	))
}

/// Handles one HTTPS request for an already-TLS-terminated connection.
/// The HTTP redirect listener (port 80) uses [`handle_redirect`] instead.
pub async fn handle(
	state: Arc<ProxyState>,
	req: Request<Incoming>,
	client_addr: SocketAddr,
) -> Response<Body> {
	let host = match host_header(&req) {
		Some(h) => strip_port(&h).to_string(),
		None => return bad_request("missing Host header"),
	};

	if host == state.dashboard_fqdn {
		let req = req.map(Body::new);
		return match state.dashboard.clone().oneshot(req).await {
			Ok(response) => response,
			Err(never) => match never {},
		};
	}

	let start = Instant::now();
	let method = req.method().to_string();
	let path = req.uri().path().to_string();

	let route = match state.registry.lookup_by_host(&host, &state.tld) {
		Some(route) => route,
		None => {
			record(&state, &host, &method, &path, 404, start, "", "");
			return not_found_page(&host);
		},
	};

	if is_websocket_upgrade(req.headers()) {
		return match proxy_websocket(&state, req, &route.name, &route.upstream, &host, &method, &path, start)
			.await
		{
			Ok(response) => response,
			Err(e) => {
				warn!(error = %e, upstream = %route.upstream, "websocket proxy failed");
				record(&state, &host, &method, &path, 502, start, &route.name, &route.upstream);
				bad_gateway(&route.name)
			},
		};
	}

	let outbound = match build_outbound_request(req, &host, client_addr) {
		Ok(req) => req,
		Err(e) => {
			record(&state, &host, &method, &path, 502, start, &route.name, &route.upstream);
			warn!(error = %e, "failed to build outbound request");
			return bad_gateway(&route.name);
		},
	};

	match send_via_pool(&state, &route.upstream, outbound).await {
		Ok(resp) => {
			let status = resp.status().as_u16();
			record(&state, &host, &method, &path, status, start, &route.name, &route.upstream);
			resp.map(Body::new)
		},
		Err(e) => {
			warn!(error = %e, upstream = %route.upstream, "upstream dial/round-trip failed");
			record(&state, &host, &method, &path, 502, start, &route.name, &route.upstream);
			bad_gateway(&route.name)
		},
	}
}

/// Handles a plain-HTTP request on port 80: a 308 redirect to the HTTPS
/// form of the same host and URI for anything under the configured TLD,
/// 400 for everything else.
pub async fn handle_redirect(tld: String, req: Request<Incoming>) -> Response<Body> {
	let host = match host_header(&req) {
		Some(h) => h,
		None => return bad_request("missing Host header"),
	};
	let bare_host = strip_port(&host);
	if bare_host != tld && !bare_host.ends_with(&format!(".{tld}")) {
		return bad_request("host is not served by this proxy");
	}
	let location = format!("https://{host}{}", req.uri());
	Response::builder()
		.status(StatusCode::PERMANENT_REDIRECT)
		.header(axum::http::header::LOCATION, location)
		.body(Body::empty())
		.unwrap_or_else(|_| bad_request("malformed redirect"))
}

fn bad_request(detail: &str) -> Response<Body> {
	Response::builder()
		.status(StatusCode::BAD_REQUEST)
		.body(error_page("Bad Request", detail, false))
		.expect("static response is well-formed")
}

fn not_found_page(host: &str) -> Response<Body> {
	let name = host.split('.').next().unwrap_or(host);
	Response::builder()
		.status(StatusCode::BAD_GATEWAY)
		.body(error_page(
			"No dev server registered",
			&format!("Run `paw run --name {name} -- <command>` to register this host."),
			true,
		))
		.expect("static response is well-formed")
}

fn bad_gateway(route: &str) -> Response<Body> {
	Response::builder()
		.status(StatusCode::BAD_GATEWAY)
		.body(error_page(
			"Dev server unreachable",
			&format!("Waiting for `{route}` to accept connections..."),
			true,
		))
		.expect("static response is well-formed")
}

#[allow(clippy::too_many_arguments)]
fn record(
	state: &ProxyState,
	host: &str,
	method: &str,
	path: &str,
	status: u16,
	start: Instant,
	route: &str,
	upstream: &str,
) {
	state.metrics.record(MetricsEntry {
		timestamp: SystemTime::now(),
		host: host.to_string(),
		method: method.to_string(),
		path: path.to_string(),
		status,
		latency_ms: start.elapsed().as_millis() as u64,
		route: route.to_string(),
		upstream: upstream.to_string(),
	});
}

/// Rewrites the request for the upstream hop: the dial target (scheme
/// `http`, host = upstream) only decides where the connection goes, not
/// what goes on the wire — the request-line keeps its original
/// origin-form path, and the original `Host` header is left untouched so
/// the upstream dev server still sees the client's real host.
fn build_outbound_request(
	mut req: Request<Incoming>,
	original_host: &str,
	client_addr: SocketAddr,
) -> Result<Request<Incoming>, DialError> {
	strip_hop_by_hop(req.headers_mut());
	let headers = req.headers_mut();
	headers.insert(
		HeaderName::from_static("x-forwarded-for"),
		HeaderValue::from_str(&client_addr.ip().to_string()).map_err(|_| DialError::MalformedHeader)?,
	);
	headers.insert(HeaderName::from_static("x-forwarded-proto"), HeaderValue::from_static("https"));
	headers.insert(
		HeaderName::from_static("x-forwarded-host"),
		HeaderValue::from_str(original_host).map_err(|_| DialError::MalformedHeader)?,
	);
	Ok(req)
}

/// Strips the standard hop-by-hop headers plus any header named in the
/// inbound `Connection` token list.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
	let extra: Vec<String> = headers
		.get(axum::http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()).collect())
		.unwrap_or_default();
	for name in HOP_BY_HOP.iter().map(|s| s.to_string()).chain(extra) {
		if let Ok(header_name) = HeaderName::try_from(&name) {
			headers.remove(header_name);
		}
	}
}

#[derive(Debug, thiserror::Error)]
enum DialError {
	#[error("malformed header value")]
	MalformedHeader,
	#[error("connecting to {v4} and {v6}: {v4_err} / {v6_err}")]
	BothFailed { v4: String, v6: String, v4_err: std::io::Error, v6_err: std::io::Error },
	#[error("invalid upstream address {0:?}")]
	InvalidUpstream(String),
	#[error("http/1 handshake: {0}")]
	Handshake(#[source] hyper::Error),
	#[error("sending request upstream: {0}")]
	Request(#[source] hyper::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Dials loopback only, defense-in-depth against a registry entry that
/// somehow bypassed validation: tries `127.0.0.1:port` first, then
/// `[::1]:port`.
async fn dial_loopback(upstream: &str, timeout: Duration) -> Result<TcpStream, DialError> {
	let (_, port) =
		paw_core::net::split_host_port(upstream).ok_or_else(|| DialError::InvalidUpstream(upstream.to_string()))?;
	let v4 = format!("127.0.0.1:{port}");
	let v6 = format!("[::1]:{port}");
	match tokio::time::timeout(timeout, TcpStream::connect(&v4)).await {
		Ok(Ok(stream)) => return Ok(stream),
		Ok(Err(v4_err)) => match tokio::time::timeout(timeout, TcpStream::connect(&v6)).await {
			Ok(Ok(stream)) => return Ok(stream),
			Ok(Err(v6_err)) => Err(DialError::BothFailed { v4, v6, v4_err, v6_err }),
			Err(_) => Err(DialError::BothFailed {
				v4,
				v6,
				v4_err,
				v6_err: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
			}),
		},
		Err(_) => Err(DialError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))),
	}
}

async fn send_via_pool(
	state: &ProxyState,
	upstream: &str,
	req: Request<Incoming>,
) -> Result<Response<Incoming>, DialError> {
	let mut sender = take_pooled(state, upstream);
	if sender.is_none() {
		let stream = dial_loopback(upstream, DIAL_TIMEOUT).await?;
		let io = TokioIo::new(stream);
		let (s, conn) = hyper::client::conn::http1::handshake(io).await.map_err(DialError::Handshake)?;
		tokio::spawn(async move {
			let _ = conn.await;
		});
		sender = Some(s);
	}
	let mut sender = sender.expect("populated above");
	let response = sender.send_request(req).await.map_err(DialError::Request)?;
	return_to_pool(state, upstream, sender);
	Ok(response)
}

fn take_pooled(
	state: &ProxyState,
	upstream: &str,
) -> Option<hyper::client::conn::http1::SendRequest<Incoming>> {
	let mut pool = state.pool.lock().expect("proxy pool lock is never poisoned");
	let queue = pool.get_mut(upstream)?;
	let now = Instant::now();
	while let Some(conn) = queue.pop_front() {
		if now.duration_since(conn.idle_since) < POOL_IDLE_TIMEOUT {
			return Some(conn.sender);
		}
	}
	None
}

/// Returns a still-usable connection to the per-upstream idle pool,
/// capped at `POOL_MAX_IDLE` entries; connections beyond the cap are
/// simply dropped and closed.
fn return_to_pool(
	state: &ProxyState,
	upstream: &str,
	sender: hyper::client::conn::http1::SendRequest<Incoming>,
) {
	let mut pool = state.pool.lock().expect("proxy pool lock is never poisoned");
	let queue = pool.entry(upstream.to_string()).or_default();
	if queue.len() < POOL_MAX_IDLE {
		queue.push_back(PooledConn { sender, idle_since: Instant::now() });
	}
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
	let upgrade = headers
		.get(axum::http::header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	let connection = headers
		.get(axum::http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
	upgrade && connection
}

#[allow(clippy::too_many_arguments)]
async fn proxy_websocket(
	state: &ProxyState,
	mut req: Request<Incoming>,
	route_name: &str,
	upstream: &str,
	host: &str,
	method: &str,
	path: &str,
	start: Instant,
) -> Result<Response<Body>, DialError> {
	let headers = req.headers();
	let has_key = headers.contains_key("sec-websocket-key");
	let version_ok = headers
		.get("sec-websocket-version")
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v == "13");
	if !has_key || !version_ok {
		return Ok(bad_request("invalid websocket handshake"));
	}

	let mut outbound_head = format!(
		"{} {} HTTP/1.1\r\n",
		req.method(),
		req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
	);
	for (name, value) in req.headers() {
		if let Ok(v) = value.to_str() {
			outbound_head.push_str(&format!("{name}: {v}\r\n"));
		}
	}
	outbound_head.push_str("\r\n");

	let mut upstream_stream = dial_loopback(upstream, WEBSOCKET_DIAL_TIMEOUT).await?;
	upstream_stream.write_all(outbound_head.as_bytes()).await?;

	let upgrade = hyper::upgrade::on(&mut req);
	let host = host.to_string();
	let method = method.to_string();
	let path = path.to_string();
	let route_name = route_name.to_string();
	let upstream_owned = upstream.to_string();
	let metrics = state.metrics.clone();

	state.tasks.spawn(async move {
		let client_upgraded = match upgrade.await {
			Ok(upgraded) => upgraded,
			Err(e) => {
				warn!(error = %e, "client connection did not upgrade");
				return;
			},
		};
		let mut client_io = TokioIo::new(client_upgraded);
		let result = relay_bidirectional(&mut client_io, &mut upstream_stream).await;
		if let Err(e) = result {
			warn!(error = %e, "websocket relay ended with an error");
		}
		metrics.record(MetricsEntry {
			timestamp: SystemTime::now(),
			host,
			method,
			path,
			status: 101,
			latency_ms: start.elapsed().as_millis() as u64,
			route: route_name,
			upstream: upstream_owned,
		});
	});

	Response::builder()
		.status(StatusCode::SWITCHING_PROTOCOLS)
		.header(axum::http::header::UPGRADE, "websocket")
		.header(axum::http::header::CONNECTION, "Upgrade")
		.header(
			"sec-websocket-accept",
			req.headers().get("sec-websocket-key").cloned().unwrap_or(HeaderValue::from_static("")),
		)
		.body(Body::empty())
		.map_err(|_| DialError::MalformedHeader)
}

/// Relays bytes in both directions until either side reaches EOF, at
/// which point the corresponding half of the peer is shut down so the
/// other direction can drain and finish on its own.
async fn relay_bidirectional<A, B>(a: &mut A, b: &mut B) -> std::io::Result<()>
where
	A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let (mut ar, mut aw) = tokio::io::split(a);
	let (mut br, mut bw) = tokio::io::split(b);

	let a_to_b = async {
		let mut buf = [0u8; 8192];
		loop {
			let n = idle_read(&mut ar, &mut buf).await?;
			if n == 0 {
				let _ = bw.shutdown().await;
				return Ok::<(), std::io::Error>(());
			}
			idle_write(&mut bw, &buf[..n]).await?;
		}
	};
	let b_to_a = async {
		let mut buf = [0u8; 8192];
		loop {
			let n = idle_read(&mut br, &mut buf).await?;
			if n == 0 {
				let _ = aw.shutdown().await;
				return Ok::<(), std::io::Error>(());
			}
			idle_write(&mut aw, &buf[..n]).await?;
		}
	};
	let (r1, r2) = tokio::join!(a_to_b, b_to_a);
	r1.and(r2)
}

/// Every successful read or write resets an idle deadline `IDLE_TIMEOUT`
/// out; no absolute deadline is ever applied, so a long-lived,
/// actively-used WebSocket is never reaped. A read that times out
/// reports EOF, which the caller treats as a clean half-close.
async fn idle_read<R: tokio::io::AsyncRead + Unpin>(
	reader: &mut R,
	buf: &mut [u8],
) -> std::io::Result<usize> {
	match tokio::time::timeout(IDLE_TIMEOUT, reader.read(buf)).await {
		Ok(result) => result,
		Err(_) => Ok(0),
	}
}

async fn idle_write<W: tokio::io::AsyncWrite + Unpin>(
	writer: &mut W,
	buf: &[u8],
) -> std::io::Result<()> {
	match tokio::time::timeout(IDLE_TIMEOUT, writer.write_all(buf)).await {
		Ok(result) => result,
		Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write idle timeout")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_hop_by_hop_and_connection_tokens() {
		let mut headers = HeaderMap::new();
		headers.insert(axum::http::header::CONNECTION, HeaderValue::from_static("keep-alive, x-custom"));
		headers.insert("x-custom", HeaderValue::from_static("value"));
		headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
		headers.insert("x-app", HeaderValue::from_static("keep"));
		strip_hop_by_hop(&mut headers);
		assert!(!headers.contains_key(axum::http::header::CONNECTION));
		assert!(!headers.contains_key("keep-alive"));
		assert!(!headers.contains_key("x-custom"));
		assert!(headers.contains_key("x-app"));
	}

	#[test]
	fn detects_websocket_upgrade_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(axum::http::header::UPGRADE, HeaderValue::from_static("websocket"));
		headers.insert(axum::http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
		assert!(is_websocket_upgrade(&headers));

		let mut headers = HeaderMap::new();
		headers.insert(axum::http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
		assert!(!is_websocket_upgrade(&headers));
	}

	#[test]
	fn html_escape_covers_reserved_characters() {
		assert_eq!(html_escape("<a>&\"b\"</a>"), "&lt;a&gt;&amp;&quot;b&quot;&lt;/a&gt;");
	}
}
