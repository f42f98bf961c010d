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

use anyhow::Result;
use clap::Parser;
use paw_proxyd::config::Args;
use paw_proxyd::lifecycle::Daemon;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	let config = args.resolve()?;

	let log_dir = config.resolved_log_dir();
	std::fs::create_dir_all(&log_dir)?;
	// Scoped so the daily log file is born mode 0600 rather than chmod'd
	// after a TOCTOU window, the same pattern the control socket bind uses.
	#[cfg(unix)]
	let previous_umask = unsafe { libc::umask(0o077) };
	let file_appender = tracing_appender::rolling::daily(&log_dir, "paw-proxy.log");
	#[cfg(unix)]
	unsafe {
		libc::umask(previous_umask);
	}
	let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(file_writer.and(std::io::stderr))
		.with_ansi(false)
		.init();

	tracing::info!(version = VERSION, tld = %config.tld, "starting paw-proxyd");

	let daemon = Daemon::construct(config)?;
	let shutdown = daemon.shutdown_handle();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			shutdown.cancel();
		}
	});

	daemon.run(VERSION).await
}
