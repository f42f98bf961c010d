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

//! A minimal HTTP/1.1 client over a Unix domain socket, talking to the
//! daemon's control API. There is no connection reuse: each call dials,
//! sends one request, and lets the connection drop, which is plenty for a
//! launcher that makes at most one request every few seconds.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use paw_core::Route;
use serde::Serialize;
use std::path::PathBuf;
use tokio::net::UnixStream;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("connecting to control socket {path}: {source}")]
	Connect {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("control socket handshake: {0}")]
	Handshake(#[source] hyper::Error),
	#[error("control socket request: {0}")]
	Request(#[source] hyper::Error),
	#[error("reading response body: {0}")]
	Body(#[source] hyper::Error),
	#[error("encoding request body: {0}")]
	Encode(#[source] serde_json::Error),
	#[error("daemon rejected the request ({status}): {body}")]
	Daemon { status: StatusCode, body: String },
}

pub struct ControlClient {
	socket: PathBuf,
}

impl ControlClient {
	pub fn new(socket: impl Into<PathBuf>) -> Self {
		Self { socket: socket.into() }
	}

	pub async fn register(&self, route: &Route) -> Result<(), ClientError> {
		#[derive(Serialize)]
		struct Body<'a> {
			name: &'a str,
			upstream: &'a str,
			dir: &'a str,
		}
		let body = serde_json::to_vec(&Body {
			name: &route.name,
			upstream: &route.upstream,
			dir: &route.dir,
		})
		.map_err(ClientError::Encode)?;
		self.call(Method::POST, "/routes".to_string(), body).await
	}

	pub async fn heartbeat(&self, name: &str) -> Result<(), ClientError> {
		self.call(Method::POST, format!("/routes/{name}/heartbeat"), Vec::new())
			.await
	}

	pub async fn deregister(&self, name: &str) -> Result<(), ClientError> {
		self.call(Method::DELETE, format!("/routes/{name}"), Vec::new()).await
	}

	async fn call(&self, method: Method, path: String, body: Vec<u8>) -> Result<(), ClientError> {
		let stream = UnixStream::connect(&self.socket)
			.await
			.map_err(|source| ClientError::Connect { path: self.socket.clone(), source })?;
		let io = TokioIo::new(stream);
		let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
			.await
			.map_err(ClientError::Handshake)?;
		tokio::spawn(async move {
			if let Err(e) = conn.await {
				tracing::debug!(error = %e, "control socket connection closed");
			}
		});

		let request = Request::builder()
			.method(method)
			.uri(path)
			.header("host", "localhost")
			.header("content-type", "application/json")
			.body(Full::new(Bytes::from(body)))
			.expect("request built from validated parts");
		let response = sender.send_request(request).await.map_err(ClientError::Request)?;
		let status = response.status();
		if status.is_success() {
			return Ok(());
		}
		let body = response
			.into_body()
			.collect()
			.await
			.map_err(ClientError::Body)?
			.to_bytes();
		Err(ClientError::Daemon { status, body: String::from_utf8_lossy(&body).into_owned() })
	}
}
