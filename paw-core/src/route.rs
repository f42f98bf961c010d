use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// A single registered route: a name the DNS responder and reverse proxy
/// recognize, the loopback upstream it forwards to, and the project
/// directory it was registered from.
///
/// Registry consumers only ever see a [`Route`] by value — there is no
/// shared-pointer variant, so mutating a returned copy can never leak back
/// into the registry's state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
	pub name: String,
	pub upstream: String,
	pub dir: String,
	#[serde(with = "unix_millis")]
	pub registered: SystemTime,
	#[serde(with = "unix_millis")]
	pub last_heartbeat: SystemTime,
}

impl Route {
	pub fn new(name: impl Into<String>, upstream: impl Into<String>, dir: impl Into<String>) -> Self {
		let now = SystemTime::now();
		Self {
			name: name.into(),
			upstream: upstream.into(),
			dir: dir.into(),
			registered: now,
			last_heartbeat: now,
		}
	}

	pub fn is_expired(&self, ttl: std::time::Duration, now: SystemTime) -> bool {
		match now.duration_since(self.last_heartbeat) {
			Ok(elapsed) => elapsed >= ttl,
			// clock went backwards relative to last heartbeat: treat as fresh
			Err(_) => false,
		}
	}
}

/// Serializes a [`SystemTime`] as milliseconds since the Unix epoch, the
/// wire format the dashboard and control API JSON both use.
mod unix_millis {
	use serde::{Deserialize, Deserializer, Serialize, Serializer};
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
		let millis = t
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::ZERO)
			.as_millis() as u64;
		millis.serialize(s)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
		let millis = u64::deserialize(d)?;
		Ok(UNIX_EPOCH + Duration::from_millis(millis))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn round_trips_through_json() {
		let route = Route::new("myapp", "localhost:3000", "/tmp/x");
		let json = serde_json::to_string(&route).unwrap();
		let back: Route = serde_json::from_str(&json).unwrap();
		assert_eq!(route, back);
	}

	#[test]
	fn expires_after_ttl() {
		let route = Route::new("myapp", "localhost:3000", "/tmp/x");
		let ttl = Duration::from_millis(100);
		assert!(!route.is_expired(ttl, route.last_heartbeat));
		let later = route.last_heartbeat + Duration::from_millis(150);
		assert!(route.is_expired(ttl, later));
	}
}
