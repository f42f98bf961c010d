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

//! Component 4.A: a fixed 1-second-window rate limiter, one instance per
//! control API endpoint.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

struct Window {
	start: Instant,
	count: u32,
}

/// A single endpoint's fixed-window limiter. `allow()` is the only
/// operation: it resets the window when a full second has elapsed,
/// otherwise increments the counter and compares against `limit`.
pub struct RateLimiter {
	limit: u32,
	window: Mutex<Window>,
}

impl RateLimiter {
	pub fn new(limit: u32) -> Self {
		Self { limit, window: Mutex::new(Window { start: Instant::now(), count: 0 }) }
	}

	pub fn allow(&self) -> bool {
		let mut window = self.window.lock().expect("rate limiter lock is never poisoned");
		let now = Instant::now();
		if now.duration_since(window.start) >= WINDOW {
			window.start = now;
			window.count = 0;
		}
		if window.count >= self.limit {
			return false;
		}
		window.count += 1;
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allows_up_to_limit_then_blocks() {
		let limiter = RateLimiter::new(3);
		assert!(limiter.allow());
		assert!(limiter.allow());
		assert!(limiter.allow());
		assert!(!limiter.allow());
	}

	#[test]
	fn rejects_precisely_at_limit_plus_one_within_a_window() {
		let limiter = RateLimiter::new(1);
		assert!(limiter.allow());
		assert!(!limiter.allow());
	}

	#[test]
	fn zero_limit_always_rejects() {
		let limiter = RateLimiter::new(0);
		assert!(!limiter.allow());
	}
}
