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

//! Free ephemeral port allocation for run mode. The listener is bound only
//! long enough to ask the OS for a free port, then dropped; whatever else
//! races to bind it after that is a known, accepted tradeoff (see
//! DESIGN.md).

use paw_core::net::LOOPBACK_V4;
use tokio::net::TcpListener;

pub async fn allocate_free_port() -> std::io::Result<u16> {
	let listener = TcpListener::bind((LOOPBACK_V4, 0)).await?;
	listener.local_addr().map(|addr| addr.port())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn allocates_a_bindable_port() {
		let port = allocate_free_port().await.unwrap();
		assert_ne!(port, 0);
		// The port should be immediately reusable now that the probe dropped it.
		TcpListener::bind((LOOPBACK_V4, port)).await.unwrap();
	}
}
