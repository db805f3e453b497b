mod config;
mod pidfile;
mod service;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use reenvoy::Orchestrator;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use crate::pidfile::PidFile;
use crate::service::ProxyService;
use crate::supervisor::Supervisor;

/// Keeps an Envoy proxy running and hot-restarts it on SIGHUP.
#[derive(Debug, Parser)]
#[command(name = "reenvoy", version, about)]
struct Cli {
	/// Config file (default: ~/.config/reenvoy/config.toml)
	#[arg(short, long)]
	config: Option<PathBuf>,
	/// Directory holding the proxy configuration
	#[arg(long)]
	config_path: Option<PathBuf>,
	/// Run the proxy through the container runtime
	#[arg(long)]
	docker: bool,
	/// Drain time in seconds
	#[arg(long)]
	drain_time: Option<u64>,
	/// Parent shutdown time in seconds
	#[arg(long)]
	parent_shutdown_time: Option<u64>,
	/// Grace period in milliseconds before a child is force-killed
	#[arg(long)]
	kill_timeout: Option<u64>,
	/// Write our pid here while running
	#[arg(long)]
	pid_file: Option<PathBuf>,
	/// First restart epoch to hand out
	#[arg(long, default_value_t = 0)]
	restart_epoch: u32,
	/// Debug logging (RUST_LOG takes precedence)
	#[arg(short, long)]
	verbose: bool,
	/// Print the command the first generation would run and exit
	#[arg(long)]
	dry_run: bool,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let default_level = if cli.verbose { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
		)
		.init();

	if let Err(e) = run(cli).await {
		eprintln!("error: {}", e);
		std::process::exit(1);
	}
}

async fn run(cli: Cli) -> Result<(), String> {
	let mut config = config::load(cli.config.as_deref())?;
	apply_overrides(&mut config, &cli);

	let orchestrator = Orchestrator::new(config.proxy_options(), config.process_options()?)
		.map_err(|e| e.to_string())?
		.with_initial_epoch(cli.restart_epoch)
		.pristine(config.process.pristine);
	orchestrator.set_environment(config.environment());
	let orchestrator = Arc::new(orchestrator);

	if cli.dry_run {
		println!("{}", orchestrator.next_command().await);
		return Ok(());
	}

	let pid_file = cli.pid_file.as_deref().map(PidFile::create).transpose()?;
	if let Some(pid_file) = &pid_file {
		tracing::debug!("pid file {}", pid_file.path().display());
	}

	// The service's own listeners are gone while the supervisor backs off,
	// so keep one registration alive for the whole run.
	let mut interrupt = signal(SignalKind::interrupt()).map_err(|e| e.to_string())?;
	let mut terminate = signal(SignalKind::terminate()).map_err(|e| e.to_string())?;

	let service = ProxyService::new(Arc::clone(&orchestrator));
	let mut supervisor = Supervisor::new("envoy", config.supervisor_spec());
	let result = tokio::select! {
		result = supervisor.run(move || {
			let service = service.clone();
			async move { service.serve().await }
		}) => result,
		_ = interrupt.recv() => Ok(()),
		_ = terminate.recv() => Ok(()),
	};

	// Waits for a stop already in progress on the listener side.
	orchestrator.stop_all_children().await;
	result.map_err(|e| e.to_string())
}

fn apply_overrides(config: &mut config::Config, cli: &Cli) {
	if let Some(path) = &cli.config_path {
		config.proxy.config_path = path.clone();
	}
	if cli.docker {
		config.proxy.docker = true;
	}
	if let Some(secs) = cli.drain_time {
		config.proxy.drain_time_secs = secs;
	}
	if let Some(secs) = cli.parent_shutdown_time {
		config.proxy.parent_shutdown_time_secs = secs;
	}
	if let Some(ms) = cli.kill_timeout {
		config.process.kill_timeout_ms = ms;
	}
}
