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

//! Component 4.G: the embedded dashboard. Static assets are baked into
//! the binary at compile time; the JSON and SSE endpoints read straight
//! from the registry and metrics store, never touching the network.

use crate::metrics::MetricsStore;
use crate::registry::Registry;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use include_dir::{Dir, include_dir};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

static ASSETS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/assets");

#[derive(Clone)]
pub struct DashboardState {
	pub registry: Arc<Registry>,
	pub metrics: Arc<MetricsStore>,
	pub version: &'static str,
}

pub fn router(state: DashboardState) -> Router {
	Router::new()
		.route("/", get(index))
		.route("/style.css", get(style))
		.route("/app.js", get(app_js))
		.route("/api/routes", get(api_routes))
		.route("/api/stats", get(api_stats))
		.route("/events", get(events))
		.with_state(state)
}

async fn asset(name: &str, content_type: &'static str) -> Response {
	match ASSETS.get_file(name) {
		Some(file) => {
			([(header::CONTENT_TYPE, content_type)], file.contents().to_vec()).into_response()
		},
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

async fn index() -> Response {
	asset("index.html", "text/html; charset=utf-8").await
}

async fn style() -> Response {
	asset("style.css", "text/css; charset=utf-8").await
}

async fn app_js() -> Response {
	asset("app.js", "application/javascript; charset=utf-8").await
}

#[derive(Serialize)]
struct RouteView {
	name: String,
	upstream: String,
	dir: String,
	#[serde(with = "unix_millis")]
	registered: std::time::SystemTime,
	requests: u64,
	#[serde(rename = "avgMs")]
	avg_ms: u64,
	errors: u64,
}

async fn api_routes(State(state): State<DashboardState>) -> Response {
	let stats = state.metrics.route_stats();
	let views: Vec<RouteView> = state
		.registry
		.list()
		.into_iter()
		.map(|route| {
			let route_stats = stats.get(&route.name).cloned().unwrap_or_default();
			RouteView {
				name: route.name,
				upstream: route.upstream,
				dir: route.dir,
				registered: route.registered,
				requests: route_stats.requests,
				avg_ms: route_stats.avg_ms(),
				errors: route_stats.errors,
			}
		})
		.collect();
	axum::Json(views).into_response()
}

#[derive(Serialize)]
struct StatsView {
	version: &'static str,
	uptime: String,
}

async fn api_stats(State(state): State<DashboardState>) -> Response {
	axum::Json(StatsView {
		version: state.version,
		uptime: crate::metrics::format_uptime(state.metrics.uptime()),
	})
	.into_response()
}

async fn events(State(state): State<DashboardState>) -> Response {
	let rx = state.metrics.subscribe();
	let stream = ReceiverStream::new(rx).map(|entry| {
		let json = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());
		Ok::<_, Infallible>(Event::default().data(json))
	});
	let sse = Sse::new(stream).keep_alive(
		axum::response::sse::KeepAlive::new()
			.interval(Duration::from_secs(15))
			.text("keep-alive"),
	);
	let mut response = sse.into_response();
	let headers = response.headers_mut();
	headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
	headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
	headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
	response
}

mod unix_millis {
	use serde::{Serialize, Serializer};
	use std::time::{SystemTime, UNIX_EPOCH};

	pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
		let millis =
			t.duration_since(UNIX_EPOCH).unwrap_or(std::time::Duration::ZERO).as_millis() as u64;
		millis.serialize(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metrics::MetricsStore;
	use crate::registry::Registry;
	use std::time::Duration as StdDuration;

	#[test]
	fn embedded_assets_are_present() {
		assert!(ASSETS.get_file("index.html").is_some());
		assert!(ASSETS.get_file("style.css").is_some());
		assert!(ASSETS.get_file("app.js").is_some());
	}

	#[tokio::test]
	async fn api_stats_reports_version_and_uptime() {
		let state = DashboardState {
			registry: Arc::new(Registry::new(StdDuration::from_secs(30), 10)),
			metrics: Arc::new(MetricsStore::new(10)),
			version: "0.1.0",
		};
		let response = api_stats(State(state)).await;
		assert_eq!(response.status(), StatusCode::OK);
	}
}
