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

//! `paw-proxyd`: a per-developer-machine HTTPS reverse proxy for local
//! dev servers. Dev servers register a name over a Unix-socket control
//! API; the daemon mints a certificate on demand, terminates TLS under a
//! single TLD, and forwards to loopback.

pub mod certs;
pub mod config;
pub mod control_api;
pub mod dashboard;
pub mod lifecycle;
pub mod metrics;
pub mod privileged;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
