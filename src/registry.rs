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

//! Component 4.C: the in-memory route registry. A single read-write lock
//! guards a `name -> Route` map; every read returns owned copies so a
//! caller mutating its own `Route` can never reach back into registry
//! state.

use paw_core::Route;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tracing::{info, instrument};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("route {0:?} already registered from {1:?}")]
	Conflict(String, String),
	#[error("route cap of {0} reached")]
	LimitReached(usize),
	#[error("route {0:?} not found")]
	NotFound(String),
}

pub struct Registry {
	routes: RwLock<HashMap<String, Route>>,
	ttl: Duration,
	cap: usize,
}

impl Registry {
	pub fn new(ttl: Duration, cap: usize) -> Self {
		Self { routes: RwLock::new(HashMap::new()), ttl, cap }
	}

	#[instrument(level = "info", skip(self), fields(route = %name))]
	pub fn register(
		&self,
		name: &str,
		upstream: &str,
		dir: &str,
	) -> Result<(), RegistryError> {
		let mut routes = self.routes.write().expect("registry lock is never poisoned");
		if let Some(existing) = routes.get(name) {
			return Err(RegistryError::Conflict(name.to_string(), existing.dir.clone()));
		}
		if routes.len() >= self.cap {
			return Err(RegistryError::LimitReached(self.cap));
		}
		routes.insert(name.to_string(), Route::new(name, upstream, dir));
		info!("route registered");
		Ok(())
	}

	#[instrument(level = "info", skip(self), fields(route = %name))]
	pub fn deregister(&self, name: &str) -> bool {
		let mut routes = self.routes.write().expect("registry lock is never poisoned");
		let existed = routes.remove(name).is_some();
		if existed {
			info!("route deregistered");
		}
		existed
	}

	pub fn lookup(&self, name: &str) -> Option<Route> {
		self.routes.read().expect("registry lock is never poisoned").get(name).cloned()
	}

	/// Reduces `host` to a candidate registry key by stripping an optional
	/// port and the configured TLD suffix, then looks it up.
	pub fn lookup_by_host(&self, host: &str, tld: &str) -> Option<Route> {
		let name = host_to_name(host, tld)?;
		self.lookup(&name)
	}

	#[instrument(level = "info", skip(self), fields(route = %name))]
	pub fn heartbeat(&self, name: &str) -> Result<(), RegistryError> {
		let mut routes = self.routes.write().expect("registry lock is never poisoned");
		match routes.get_mut(name) {
			Some(route) => {
				route.last_heartbeat = SystemTime::now();
				Ok(())
			},
			None => Err(RegistryError::NotFound(name.to_string())),
		}
	}

	/// Scans under a read lock to find expired names, then re-verifies and
	/// deletes each one under the write lock, so a heartbeat racing with
	/// cleanup can never be dropped.
	#[instrument(level = "info", skip(self))]
	pub fn cleanup(&self) {
		let now = SystemTime::now();
		let candidates: Vec<String> = {
			let routes = self.routes.read().expect("registry lock is never poisoned");
			routes
				.iter()
				.filter(|(_, route)| route.is_expired(self.ttl, now))
				.map(|(name, _)| name.clone())
				.collect()
		};
		if candidates.is_empty() {
			return;
		}
		let mut routes = self.routes.write().expect("registry lock is never poisoned");
		for name in candidates {
			if routes.get(&name).is_some_and(|route| route.is_expired(self.ttl, now)) {
				routes.remove(&name);
				info!(route = %name, "route expired");
			}
		}
	}

	pub fn list(&self) -> Vec<Route> {
		self.routes.read().expect("registry lock is never poisoned").values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.routes.read().expect("registry lock is never poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// `<name>.<tld>[:port]` -> `<name>`. An empty reduction (the bare TLD
/// itself, with or without a port) is not a registrable name and yields
/// `None`.
pub fn host_to_name(host: &str, tld: &str) -> Option<String> {
	let host = host.split_once(':').map(|(h, _)| h).unwrap_or(host);
	let suffix = format!(".{tld}");
	let name = host.strip_suffix(&suffix)?;
	if name.is_empty() { None } else { Some(name.to_string()) }
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn register_then_lookup_round_trips() {
		let registry = Registry::new(Duration::from_secs(30), 1024);
		registry.register("app", "localhost:3000", "/tmp/app").unwrap();
		let route = registry.lookup("app").unwrap();
		assert_eq!(route.upstream, "localhost:3000");
		assert_eq!(route.dir, "/tmp/app");
	}

	#[test]
	fn duplicate_name_conflicts_with_existing_dir() {
		let registry = Registry::new(Duration::from_secs(30), 1024);
		registry.register("app", "localhost:3000", "/tmp/a").unwrap();
		let err = registry.register("app", "localhost:4000", "/tmp/b").unwrap_err();
		assert!(matches!(err, RegistryError::Conflict(_, dir) if dir == "/tmp/a"));
	}

	#[test]
	fn cap_is_enforced() {
		let registry = Registry::new(Duration::from_secs(30), 1);
		registry.register("a", "localhost:3000", "/tmp/a").unwrap();
		let err = registry.register("b", "localhost:3001", "/tmp/b").unwrap_err();
		assert!(matches!(err, RegistryError::LimitReached(1)));
	}

	#[test]
	fn heartbeat_of_unknown_route_errors() {
		let registry = Registry::new(Duration::from_secs(30), 1024);
		assert!(matches!(registry.heartbeat("ghost"), Err(RegistryError::NotFound(_))));
	}

	#[test]
	fn cleanup_removes_only_expired_routes() {
		let registry = Registry::new(Duration::from_millis(10), 1024);
		registry.register("stale", "localhost:3000", "/tmp/stale").unwrap();
		std::thread::sleep(Duration::from_millis(20));
		registry.register("fresh", "localhost:3001", "/tmp/fresh").unwrap();
		registry.cleanup();
		assert!(registry.lookup("stale").is_none());
		assert!(registry.lookup("fresh").is_some());
	}

	#[test]
	fn lookup_returns_copies_not_references() {
		let registry = Registry::new(Duration::from_secs(30), 1024);
		registry.register("app", "localhost:3000", "/tmp/app").unwrap();
		let mut copy = registry.lookup("app").unwrap();
		copy.upstream = "localhost:9999".to_string();
		assert_eq!(registry.lookup("app").unwrap().upstream, "localhost:3000");
	}

	#[test]
	fn host_to_name_strips_port_and_tld() {
		assert_eq!(host_to_name("myapp.test:443", "test"), Some("myapp".to_string()));
		assert_eq!(host_to_name("myapp.test", "test"), Some("myapp".to_string()));
		assert_eq!(host_to_name("svc.proj.test", "test"), Some("svc.proj".to_string()));
		assert_eq!(host_to_name("test", "test"), None);
		assert_eq!(host_to_name("other.com", "test"), None);
	}
}
