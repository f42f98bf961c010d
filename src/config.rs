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

//! Daemon configuration: defaults mirror the component design throughout
//! this crate, loadable from an optional YAML file and overridable from
//! the command line.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_tld() -> String {
	"test".to_string()
}

fn default_support_dir() -> PathBuf {
	dirs_support_dir()
}

fn default_log_dir() -> Option<PathBuf> {
	None
}

fn dirs_support_dir() -> PathBuf {
	std::env::var_os("HOME")
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from("/var/lib"))
		.join(".paw-proxy")
}

const fn default_route_ttl_secs() -> u64 {
	30
}

const fn default_route_cap() -> usize {
	1024
}

const fn default_cert_cache_cap() -> usize {
	1000
}

const fn default_metrics_cap() -> usize {
	1000
}

const fn default_dns_port() -> u16 {
	9353
}

fn default_dashboard_host() -> String {
	"_paw".to_string()
}

/// Daemon-wide configuration. All fields have defaults so an absent
/// `config.yaml` is equivalent to `Config::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	/// Top-level domain every route lives under, e.g. `myapp.test`.
	pub tld: String,
	/// Directory holding the CA, the control socket, and (absent an
	/// explicit `log_dir`) the log file.
	pub support_dir: PathBuf,
	/// Directory for the structured log file. Defaults to `support_dir`.
	pub log_dir: Option<PathBuf>,
	/// Route heartbeat TTL, in seconds, before the reaper considers a
	/// route dead.
	pub route_ttl_secs: u64,
	/// Maximum number of simultaneously registered routes.
	pub route_cap: usize,
	/// Maximum number of cached leaf certificates.
	pub cert_cache_cap: usize,
	/// Capacity of the metrics ring buffer.
	pub metrics_cap: usize,
	/// UDP/TCP port the DNS responder listens on.
	pub dns_port: u16,
	/// Reserved dashboard hostname, relative to `tld` (e.g. `_paw` means
	/// `_paw.test`).
	pub dashboard_host: String,
	/// Per-endpoint rate limits, requests per second.
	pub rate_limits: RateLimits,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			tld: default_tld(),
			support_dir: default_support_dir(),
			log_dir: default_log_dir(),
			route_ttl_secs: default_route_ttl_secs(),
			route_cap: default_route_cap(),
			cert_cache_cap: default_cert_cache_cap(),
			metrics_cap: default_metrics_cap(),
			dns_port: default_dns_port(),
			dashboard_host: default_dashboard_host(),
			rate_limits: RateLimits::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimits {
	pub register: u32,
	pub deregister: u32,
	pub heartbeat: u32,
	pub list: u32,
	pub health: u32,
}

impl Default for RateLimits {
	fn default() -> Self {
		Self { register: 10, deregister: 10, heartbeat: 100, list: 50, health: 100 }
	}
}

impl Config {
	/// Loads configuration from `path` if it exists, falling back to
	/// `Config::default()` if it does not.
	pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
		match std::fs::read_to_string(path) {
			Ok(contents) => {
				let config: Config = serde_yaml::from_str(&contents)?;
				Ok(config)
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
			Err(e) => Err(e.into()),
		}
	}

	pub fn ca_cert_path(&self) -> PathBuf {
		self.support_dir.join("ca.crt")
	}

	pub fn ca_key_path(&self) -> PathBuf {
		self.support_dir.join("ca.key")
	}

	pub fn control_socket_path(&self) -> PathBuf {
		self.support_dir.join("paw-proxy.sock")
	}

	pub fn resolved_log_dir(&self) -> PathBuf {
		self.log_dir.clone().unwrap_or_else(|| self.support_dir.clone())
	}

	/// Full dashboard host, e.g. `_paw.test`.
	pub fn dashboard_fqdn(&self) -> String {
		format!("{}.{}", self.dashboard_host, self.tld)
	}

	pub fn route_ttl(&self) -> std::time::Duration {
		std::time::Duration::from_secs(self.route_ttl_secs)
	}
}

/// Command-line overrides, layered on top of a loaded [`Config`].
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "paw-proxyd", version, about = "Local HTTPS reverse proxy for dev servers")]
pub struct Args {
	/// Path to `config.yaml`. Defaults to `<support-dir>/config.yaml`.
	#[arg(long)]
	pub config: Option<PathBuf>,
	/// Overrides `support_dir`.
	#[arg(long)]
	pub support_dir: Option<PathBuf>,
	/// Overrides `tld`.
	#[arg(long)]
	pub tld: Option<String>,
	/// Overrides `dns_port`.
	#[arg(long)]
	pub dns_port: Option<u16>,
}

impl Args {
	pub fn resolve(self) -> anyhow::Result<Config> {
		let config_path = self
			.config
			.clone()
			.unwrap_or_else(|| self.support_dir.clone().unwrap_or_else(default_support_dir).join("config.yaml"));
		let mut config = Config::load(&config_path)?;
		if let Some(dir) = self.support_dir {
			config.support_dir = dir;
		}
		if let Some(tld) = self.tld {
			config.tld = tld;
		}
		if let Some(port) = self.dns_port {
			config.dns_port = port;
		}
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_internally_consistent() {
		let config = Config::default();
		assert_eq!(config.dashboard_fqdn(), "_paw.test");
		assert_eq!(config.ca_cert_path().file_name().unwrap(), "ca.crt");
	}

	#[test]
	fn missing_file_falls_back_to_defaults() {
		let config = Config::load(std::path::Path::new("/nonexistent/config.yaml")).unwrap();
		assert_eq!(config.tld, "test");
	}

	#[test]
	fn rate_limit_defaults_match_component_design() {
		let limits = RateLimits::default();
		assert_eq!(limits.register, 10);
		assert_eq!(limits.heartbeat, 100);
	}
}
