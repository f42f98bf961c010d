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

//! Compose mode: a minimal reader for the subset of a container-compose
//! file this launcher cares about (service names and published ports).
//! It deliberately does not model the rest of the compose schema —
//! volumes, networks, build contexts, and so on are invisible to us, and
//! an unrecognized top-level key is not an error.

use paw_core::Route;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
	#[error("parsing compose file: {0}")]
	Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize)]
pub struct ComposeFile {
	#[serde(default)]
	services: BTreeMap<String, Service>,
}

#[derive(Debug, Deserialize, Default)]
struct Service {
	#[serde(default)]
	ports: Vec<PortEntry>,
}

/// A port can be written as a short string form (`"8080:80"`,
/// `"127.0.0.1:9000:9000"`, `"8080:80/tcp"`) or a long mapping form
/// (`{published: 8080, target: 80}`). Only the published (host-side) port
/// matters to us.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortEntry {
	Short(PortNumberOrString),
	Long { published: PortNumberOrString },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortNumberOrString {
	Number(u16),
	Text(String),
}

impl PortEntry {
	fn published(&self) -> Option<u16> {
		match self {
			PortEntry::Long { published } => published.as_u16(),
			PortEntry::Short(PortNumberOrString::Number(port)) => Some(*port),
			PortEntry::Short(PortNumberOrString::Text(text)) => parse_short_form(text),
		}
	}
}

impl PortNumberOrString {
	fn as_u16(&self) -> Option<u16> {
		match self {
			PortNumberOrString::Number(n) => Some(*n),
			PortNumberOrString::Text(s) => s.parse().ok(),
		}
	}
}

/// Extracts the published (host) port from a short-form string. The
/// container port and protocol suffix are ignored; only the host side
/// of the mapping can become a loopback upstream.
fn parse_short_form(text: &str) -> Option<u16> {
	let without_protocol = text.split('/').next().unwrap_or(text);
	let parts: Vec<&str> = without_protocol.split(':').collect();
	let published = match parts.as_slice() {
		[published] => *published,
		[published, _container] => *published,
		[_host_ip, published, _container] => *published,
		_ => return None,
	};
	published.parse().ok()
}

pub fn parse(content: &str) -> Result<ComposeFile, ComposeError> {
	Ok(serde_yaml::from_str(content)?)
}

/// One route per published port. A service with a single published port
/// is named after the service; a service with several is disambiguated
/// as `service.<port>`.
pub fn routes_from_compose(file: &ComposeFile, dir: &Path) -> Vec<Route> {
	let dir = dir.to_string_lossy().into_owned();
	let mut routes = Vec::new();
	for (service, def) in &file.services {
		let published: Vec<u16> = def.ports.iter().filter_map(PortEntry::published).collect();
		let multiple = published.len() > 1;
		for port in published {
			let name = if multiple { format!("{service}.{port}") } else { service.clone() };
			routes.push(Route::new(name, format!("127.0.0.1:{port}"), dir.clone()));
		}
	}
	routes
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_short_and_long_forms() {
		let yaml = r#"
services:
  web:
    ports:
      - "8080:80"
  db:
    ports:
      - "127.0.0.1:5432:5432"
  api:
    ports:
      - published: 9000
        target: 9000
"#;
		let file = parse(yaml).unwrap();
		let routes = routes_from_compose(&file, Path::new("/tmp/proj"));
		let mut by_name: BTreeMap<_, _> = routes.into_iter().map(|r| (r.name.clone(), r)).collect();
		assert_eq!(by_name.remove("web").unwrap().upstream, "127.0.0.1:8080");
		assert_eq!(by_name.remove("db").unwrap().upstream, "127.0.0.1:5432");
		assert_eq!(by_name.remove("api").unwrap().upstream, "127.0.0.1:9000");
		assert!(by_name.is_empty());
	}

	#[test]
	fn service_with_multiple_ports_gets_suffixed_names() {
		let yaml = r#"
services:
  app:
    ports:
      - "3000:3000"
      - "3001:3001/tcp"
"#;
		let file = parse(yaml).unwrap();
		let routes = routes_from_compose(&file, Path::new("/tmp/proj"));
		let names: Vec<_> = routes.iter().map(|r| r.name.as_str()).collect();
		assert!(names.contains(&"app.3000"));
		assert!(names.contains(&"app.3001"));
	}

	#[test]
	fn service_without_ports_yields_no_route() {
		let yaml = "services:\n  worker: {}\n";
		let file = parse(yaml).unwrap();
		assert!(routes_from_compose(&file, Path::new("/tmp/proj")).is_empty());
	}
}
