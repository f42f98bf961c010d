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

//! Component 4.I: the control API. A Unix-domain-socket HTTP server the
//! launcher talks to; never reachable over the network.

use crate::config::RateLimits;
use crate::metrics::{MetricsStore, format_uptime};
use crate::ratelimit::RateLimiter;
use crate::registry::{Registry, RegistryError};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Router, body::Bytes};
use paw_core::Route;
use paw_core::validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UnixListener;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct ApiState {
	registry: Arc<Registry>,
	metrics: Arc<MetricsStore>,
	version: &'static str,
	start: std::time::Instant,
	register_limiter: Arc<RateLimiter>,
	deregister_limiter: Arc<RateLimiter>,
	heartbeat_limiter: Arc<RateLimiter>,
	list_limiter: Arc<RateLimiter>,
	health_limiter: Arc<RateLimiter>,
}

impl ApiState {
	pub fn new(
		registry: Arc<Registry>,
		metrics: Arc<MetricsStore>,
		version: &'static str,
		limits: &RateLimits,
	) -> Self {
		Self {
			registry,
			metrics,
			version,
			start: std::time::Instant::now(),
			register_limiter: Arc::new(RateLimiter::new(limits.register)),
			deregister_limiter: Arc::new(RateLimiter::new(limits.deregister)),
			heartbeat_limiter: Arc::new(RateLimiter::new(limits.heartbeat)),
			list_limiter: Arc::new(RateLimiter::new(limits.list)),
			health_limiter: Arc::new(RateLimiter::new(limits.health)),
		}
	}
}

pub fn router(state: ApiState) -> Router {
	Router::new()
		.route("/routes", post(register).get(list))
		.route("/routes/{name}", delete(deregister))
		.route("/routes/{name}/heartbeat", post(heartbeat))
		.route("/health", get(health))
		.with_state(state)
}

/// Binds the control socket with umask 0o077 so it is born mode 0600,
/// avoiding a TOCTOU window between `bind` and a later `chmod`.
pub fn bind_socket(path: &std::path::Path) -> std::io::Result<UnixListener> {
	if path.exists() {
		std::fs::remove_file(path)?;
	}
	#[cfg(unix)]
	{
		// SAFETY: umask is process-global and briefly restricted around the
		// single bind call below, then unconditionally restored.
		let previous = unsafe { libc::umask(0o077) };
		let result = UnixListener::bind(path);
		unsafe { libc::umask(previous) };
		result
	}
	#[cfg(not(unix))]
	{
		UnixListener::bind(path)
	}
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
	#[serde(rename = "existingDir", skip_serializing_if = "Option::is_none")]
	existing_dir: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
	(status, Json(ErrorBody { error: message.into(), existing_dir: None })).into_response()
}

fn conflict_response(message: impl Into<String>, existing_dir: String) -> Response {
	(StatusCode::CONFLICT, Json(ErrorBody { error: message.into(), existing_dir: Some(existing_dir) }))
		.into_response()
}

#[derive(Deserialize)]
struct RegisterBody {
	name: String,
	upstream: String,
	dir: String,
}

async fn register(State(state): State<ApiState>, body: Bytes) -> Response {
	if !state.register_limiter.allow() {
		return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
	}
	if body.len() > MAX_BODY_BYTES {
		return error_response(StatusCode::BAD_REQUEST, "request body too large");
	}
	let payload: RegisterBody = match serde_json::from_slice(&body) {
		Ok(p) => p,
		Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("malformed body: {e}")),
	};

	if let Err(e) = validate::validate_route_name(&payload.name) {
		return error_response(StatusCode::BAD_REQUEST, e.to_string());
	}
	if let Err(e) = validate::validate_upstream(&payload.upstream) {
		return error_response(StatusCode::BAD_REQUEST, e.to_string());
	}
	if let Err(e) = validate::validate_dir(&payload.dir) {
		return error_response(StatusCode::BAD_REQUEST, e.to_string());
	}

	match state.registry.register(&payload.name, &payload.upstream, &payload.dir) {
		Ok(()) => StatusCode::OK.into_response(),
		Err(RegistryError::Conflict(_, existing_dir)) => {
			conflict_response("route name already registered", existing_dir)
		},
		Err(RegistryError::LimitReached(cap)) => {
			error_response(StatusCode::TOO_MANY_REQUESTS, format!("route cap of {cap} reached"))
		},
		Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

async fn deregister(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
	if !state.deregister_limiter.allow() {
		return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
	}
	if validate::validate_route_name(&name).is_err() {
		return error_response(StatusCode::BAD_REQUEST, "invalid route name");
	}
	if state.registry.deregister(&name) {
		StatusCode::OK.into_response()
	} else {
		error_response(StatusCode::NOT_FOUND, "no such route")
	}
}

async fn heartbeat(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
	if !state.heartbeat_limiter.allow() {
		return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
	}
	if validate::validate_route_name(&name).is_err() {
		return error_response(StatusCode::BAD_REQUEST, "invalid route name");
	}
	match state.registry.heartbeat(&name) {
		Ok(()) => StatusCode::OK.into_response(),
		Err(RegistryError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "no such route"),
		Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

async fn list(State(state): State<ApiState>) -> Response {
	if !state.list_limiter.allow() {
		return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
	}
	Json(state.registry.list()).into_response()
}

#[derive(Serialize)]
struct HealthBody {
	status: &'static str,
	version: &'static str,
	uptime: String,
}

async fn health(State(state): State<ApiState>) -> Response {
	if !state.health_limiter.allow() {
		return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
	}
	let _ = &state.metrics;
	Json(HealthBody {
		status: "ok",
		version: state.version,
		uptime: format_uptime(state.start.elapsed()),
	})
	.into_response()
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::Body;
	use axum::http::Request;
	use http_body_util::BodyExt;
	use std::time::Duration;
	use tower::ServiceExt;

	fn test_state() -> ApiState {
		ApiState::new(
			Arc::new(Registry::new(Duration::from_secs(30), 10)),
			Arc::new(MetricsStore::new(10)),
			"0.1.0-test",
			&RateLimits::default(),
		)
	}

	#[tokio::test]
	async fn register_then_list_then_deregister_round_trips() {
		let app = router(test_state());

		let body = serde_json::json!({"name": "web", "upstream": "127.0.0.1:3000", "dir": "/tmp"});
		let req = Request::builder()
			.method("POST")
			.uri("/routes")
			.header("content-type", "application/json")
			.body(Body::from(body.to_string()))
			.unwrap();
		let response = app.clone().oneshot(req).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		let req = Request::builder().uri("/routes").body(Body::empty()).unwrap();
		let response = app.clone().oneshot(req).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let bytes = response.into_body().collect().await.unwrap().to_bytes();
		let routes: Vec<Route> = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(routes.len(), 1);
		assert_eq!(routes[0].name, "web");

		let req = Request::builder().method("DELETE").uri("/routes/web").body(Body::empty()).unwrap();
		let response = app.clone().oneshot(req).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn duplicate_register_returns_conflict_with_existing_dir() {
		let app = router(test_state());
		for dir in ["/tmp/a", "/tmp/b"] {
			let body = serde_json::json!({"name": "web", "upstream": "127.0.0.1:3000", "dir": dir});
			let req = Request::builder()
				.method("POST")
				.uri("/routes")
				.header("content-type", "application/json")
				.body(Body::from(body.to_string()))
				.unwrap();
			let response = app.clone().oneshot(req).await.unwrap();
			if dir == "/tmp/a" {
				assert_eq!(response.status(), StatusCode::OK);
			} else {
				assert_eq!(response.status(), StatusCode::CONFLICT);
				let bytes = response.into_body().collect().await.unwrap().to_bytes();
				let parsed: ErrorResponseProbe = serde_json::from_slice(&bytes).unwrap();
				assert_eq!(parsed.existing_dir.as_deref(), Some("/tmp/a"));
			}
		}
	}

	#[derive(Deserialize)]
	struct ErrorResponseProbe {
		#[serde(rename = "existingDir")]
		existing_dir: Option<String>,
	}

	#[tokio::test]
	async fn deregister_missing_route_is_not_found() {
		let app = router(test_state());
		let req = Request::builder().method("DELETE").uri("/routes/ghost").body(Body::empty()).unwrap();
		let response = app.oneshot(req).await.unwrap();
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn bad_route_name_is_rejected_before_any_mutation() {
		let app = router(test_state());
		let body = serde_json::json!({"name": "Not Valid!", "upstream": "127.0.0.1:3000", "dir": "/tmp"});
		let req = Request::builder()
			.method("POST")
			.uri("/routes")
			.header("content-type", "application/json")
			.body(Body::from(body.to_string()))
			.unwrap();
		let response = app.oneshot(req).await.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn health_reports_ok_status() {
		let app = router(test_state());
		let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
		let response = app.oneshot(req).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}
}
