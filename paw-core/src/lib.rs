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

//! Shared types between the daemon and the launcher: the `Route` record,
//! the validation rules both sides must agree on, and loopback-address
//! helpers used by the proxy's dialer and the launcher's port probe alike.

pub mod net;
pub mod route;
pub mod validate;

pub use route::Route;
pub use validate::ValidationError;
