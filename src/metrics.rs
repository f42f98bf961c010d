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

//! Component 4.F: a fixed-capacity ring buffer of request records, a
//! per-route aggregate map, and a fan-out of every recorded entry to
//! live subscribers (the dashboard's `/events` stream). Recording never
//! blocks on a slow subscriber: sends use a bounded channel with a
//! non-blocking, drop-on-full policy.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;
use tokio::sync::mpsc;

const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsEntry {
	#[serde(with = "unix_millis")]
	pub timestamp: SystemTime,
	pub host: String,
	pub method: String,
	pub path: String,
	pub status: u16,
	pub latency_ms: u64,
	pub route: String,
	pub upstream: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteStats {
	pub requests: u64,
	pub total_ms: u64,
	pub errors: u64,
	#[serde(with = "unix_millis_opt")]
	pub last_seen: Option<SystemTime>,
}

impl RouteStats {
	pub fn avg_ms(&self) -> u64 {
		if self.requests == 0 { 0 } else { self.total_ms / self.requests }
	}
}

struct RingBuffer {
	entries: Vec<Option<MetricsEntry>>,
	next: usize,
	count: usize,
}

impl RingBuffer {
	fn new(cap: usize) -> Self {
		Self { entries: vec![None; cap.max(1)], next: 0, count: 0 }
	}

	fn push(&mut self, entry: MetricsEntry) {
		let cap = self.entries.len();
		self.entries[self.next] = Some(entry);
		self.next = (self.next + 1) % cap;
		self.count = (self.count + 1).min(cap);
	}

	/// Up to `n` most recent entries, newest first.
	fn recent(&self, n: usize) -> Vec<MetricsEntry> {
		let cap = self.entries.len();
		let take = n.min(self.count);
		let mut out = Vec::with_capacity(take);
		for i in 0..take {
			let idx = (self.next + cap - 1 - i) % cap;
			if let Some(entry) = &self.entries[idx] {
				out.push(entry.clone());
			}
		}
		out
	}
}

pub struct MetricsStore {
	buffer: Mutex<RingBuffer>,
	routes: RwLock<HashMap<String, RouteStats>>,
	subscribers: Mutex<Vec<mpsc::Sender<MetricsEntry>>>,
	start: SystemTime,
}

impl MetricsStore {
	pub fn new(cap: usize) -> Self {
		Self {
			buffer: Mutex::new(RingBuffer::new(cap)),
			routes: RwLock::new(HashMap::new()),
			subscribers: Mutex::new(Vec::new()),
			start: SystemTime::now(),
		}
	}

	pub fn record(&self, entry: MetricsEntry) {
		{
			let mut routes = self.routes.write().expect("metrics lock is never poisoned");
			let stats = routes.entry(entry.route.clone()).or_default();
			stats.requests += 1;
			stats.total_ms += entry.latency_ms;
			if entry.status >= 500 {
				stats.errors += 1;
			}
			stats.last_seen = Some(entry.timestamp);
		}
		self.buffer.lock().expect("metrics lock is never poisoned").push(entry.clone());

		let mut subscribers = self.subscribers.lock().expect("metrics lock is never poisoned");
		subscribers.retain(|tx| match tx.try_send(entry.clone()) {
			Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		});
	}

	pub fn recent(&self, n: usize) -> Vec<MetricsEntry> {
		self.buffer.lock().expect("metrics lock is never poisoned").recent(n)
	}

	pub fn route_stats(&self) -> HashMap<String, RouteStats> {
		self.routes.read().expect("metrics lock is never poisoned").clone()
	}

	pub fn subscribe(&self) -> mpsc::Receiver<MetricsEntry> {
		let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
		self.subscribers.lock().expect("metrics lock is never poisoned").push(tx);
		rx
	}

	pub fn uptime(&self) -> std::time::Duration {
		SystemTime::now().duration_since(self.start).unwrap_or_default()
	}
}

/// `3725s` -> `1h 2m`; anything under a minute is rendered in seconds,
/// under an hour in minutes and seconds, otherwise hours and minutes.
pub fn format_uptime(uptime: std::time::Duration) -> String {
	let total = uptime.as_secs();
	let hours = total / 3600;
	let minutes = (total % 3600) / 60;
	let seconds = total % 60;
	if hours > 0 {
		format!("{hours}h {minutes}m")
	} else if minutes > 0 {
		format!("{minutes}m {seconds}s")
	} else {
		format!("{seconds}s")
	}
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

mod unix_millis_opt {
	use serde::{Serialize, Serializer};
	use std::time::{SystemTime, UNIX_EPOCH};

	pub fn serialize<S: Serializer>(t: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
		let millis = t.map(|t| t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64);
		millis.serialize(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(route: &str, status: u16, latency_ms: u64) -> MetricsEntry {
		MetricsEntry {
			timestamp: SystemTime::now(),
			host: format!("{route}.test"),
			method: "GET".to_string(),
			path: "/".to_string(),
			status,
			latency_ms,
			route: route.to_string(),
			upstream: "localhost:3000".to_string(),
		}
	}

	#[test]
	fn ring_buffer_wraps_and_orders_newest_first() {
		let store = MetricsStore::new(2);
		store.record(entry("a", 200, 10));
		store.record(entry("b", 200, 20));
		store.record(entry("c", 200, 30));
		let recent = store.recent(10);
		assert_eq!(recent.len(), 2);
		assert_eq!(recent[0].route, "c");
		assert_eq!(recent[1].route, "b");
	}

	#[test]
	fn aggregates_track_errors_and_average_latency() {
		let store = MetricsStore::new(10);
		store.record(entry("a", 200, 10));
		store.record(entry("a", 500, 30));
		let stats = store.route_stats();
		let a = stats.get("a").unwrap();
		assert_eq!(a.requests, 2);
		assert_eq!(a.errors, 1);
		assert_eq!(a.avg_ms(), 20);
	}

	#[tokio::test]
	async fn subscriber_receives_recorded_entries() {
		let store = MetricsStore::new(10);
		let mut rx = store.subscribe();
		store.record(entry("a", 200, 5));
		let received = rx.recv().await.unwrap();
		assert_eq!(received.route, "a");
	}

	#[test]
	fn record_never_blocks_on_a_full_subscriber_queue() {
		let store = MetricsStore::new(10);
		let _rx = store.subscribe();
		for _ in 0..SUBSCRIBER_CAPACITY + 10 {
			store.record(entry("a", 200, 1));
		}
		// Would have blocked or panicked above if the drop-on-full policy
		// were not in effect.
	}

	#[test]
	fn uptime_formatting_boundaries() {
		assert_eq!(format_uptime(std::time::Duration::from_secs(5)), "5s");
		assert_eq!(format_uptime(std::time::Duration::from_secs(125)), "2m 5s");
		assert_eq!(format_uptime(std::time::Duration::from_secs(3725)), "1h 2m");
	}
}
