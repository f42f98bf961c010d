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

//! Companion launcher (component 4.L): registers a route for a dev
//! command, execs it bound to an allocated port, keeps it alive with
//! heartbeats, and deregisters on exit. A second subcommand registers one
//! route per service published in a compose file.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use paw_core::Route;
use paw_core::validate::validate_route_name;
use paw_launcher::client::ControlClient;
use paw_launcher::{compose, port};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::interval;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "paw", version, about = "Register local dev servers with the paw-proxy daemon")]
struct Cli {
	/// Path to the daemon's control socket.
	#[arg(long, global = true, default_value = "paw-proxy.sock")]
	socket: PathBuf,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Allocate a free port, register a route, and exec a command bound to it.
	Run {
		#[arg(long)]
		name: String,
		/// Command to run, e.g. `-- npm run dev`.
		#[arg(trailing_var_arg = true, required = true)]
		command: Vec<String>,
	},
	/// Register one route per published port in a compose file.
	Compose {
		#[arg(short, long, default_value = "docker-compose.yml")]
		file: PathBuf,
	},
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();
	let cli = Cli::parse();
	match cli.command {
		Commands::Run { name, command } => run(&cli.socket, &name, &command).await,
		Commands::Compose { file } => compose_up(&cli.socket, &file).await,
	}
}

async fn run(socket: &PathBuf, name: &str, command: &[String]) -> Result<()> {
	validate_route_name(name).with_context(|| format!("invalid route name {name:?}"))?;
	let (program, args) = command.split_first().context("no command given to run")?;

	let port_num = port::allocate_free_port().await.context("allocating a free port")?;
	let dir = std::env::current_dir().context("reading current directory")?;
	let dir = dir.to_str().context("project directory is not valid UTF-8")?.to_string();
	let upstream = format!("127.0.0.1:{port_num}");

	let client = ControlClient::new(socket.clone());
	client
		.register(&Route::new(name, upstream.clone(), dir))
		.await
		.context("registering route")?;
	tracing::info!(name, upstream = %upstream, "route registered");

	let mut child = Command::new(program)
		.args(args)
		.env("PORT", port_num.to_string())
		.kill_on_drop(true)
		.spawn()
		.with_context(|| format!("spawning {program:?}"))?;

	let heartbeat_task = {
		let client = ControlClient::new(socket.clone());
		let name = name.to_string();
		tokio::spawn(async move {
			let mut ticker = interval(HEARTBEAT_INTERVAL);
			ticker.tick().await; // first tick fires immediately
			loop {
				ticker.tick().await;
				// A failed heartbeat is the launcher's problem to retry, never the
				// child's: it keeps running regardless.
				if let Err(e) = client.heartbeat(&name).await {
					tracing::warn!(error = %e, "heartbeat failed, will retry");
				}
			}
		})
	};

	let wait_result = tokio::select! {
		status = child.wait() => status.context("waiting for child process"),
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("received interrupt, stopping child");
			let _ = child.start_kill();
			child.wait().await.context("waiting for child process after interrupt")
		}
	};

	heartbeat_task.abort();
	if let Err(e) = client.deregister(name).await {
		tracing::warn!(error = %e, "deregistering route failed");
	}

	let status = wait_result?;
	if !status.success() {
		bail!("child exited with {status}");
	}
	Ok(())
}

async fn compose_up(socket: &PathBuf, file: &PathBuf) -> Result<()> {
	let content =
		std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
	let parsed = compose::parse(&content).with_context(|| format!("parsing {}", file.display()))?;

	let dir = file
		.parent()
		.filter(|p| !p.as_os_str().is_empty())
		.map(Path::to_path_buf)
		.unwrap_or_else(|| PathBuf::from("."));
	let dir = std::fs::canonicalize(&dir).with_context(|| format!("resolving {}", dir.display()))?;

	let routes = compose::routes_from_compose(&parsed, &dir);
	if routes.is_empty() {
		tracing::warn!(file = %file.display(), "compose file published no ports, nothing to register");
		return Ok(());
	}

	let client = ControlClient::new(socket.clone());
	for route in &routes {
		match client.register(route).await {
			Ok(()) => tracing::info!(name = %route.name, upstream = %route.upstream, "route registered"),
			Err(e) => tracing::error!(name = %route.name, error = %e, "registering route failed"),
		}
	}
	Ok(())
}
