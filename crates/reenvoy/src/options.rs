use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::ConfigError;
use crate::output::Output;

pub const ENVOY_DOCKER_IMAGE: &str = "envoyproxy/envoy:3f59fb5c0f6554f8b3f2e73ab4c1437a63d42668";
pub const DEFAULT_DRAIN_TIME: Duration = Duration::from_secs(60);
pub const DEFAULT_PARENT_SHUTDOWN_TIME: Duration = Duration::from_secs(70);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-process template: everything a [`ProcessHandle`](crate::ProcessHandle)
/// needs besides the command line itself.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
	/// `key=value` entries. Empty means the child inherits our environment.
	pub env: Vec<String>,
	/// Sent by `restart()` to reload in place. `None` makes restart a kill + start.
	pub reload_signal: Option<Signal>,
	/// Graceful termination signal. `None` goes straight to SIGKILL.
	pub kill_signal: Option<Signal>,
	/// How long `start()` waits for the command to finish. Zero never waits.
	pub start_timeout: Duration,
	/// How long `kill()` waits after the kill signal before escalating.
	pub kill_timeout: Duration,
	/// Upper bound of the random delay inserted before any signal.
	pub splay: Duration,
	pub output: Output,
}

impl Default for ProcessOptions {
	fn default() -> Self {
		Self {
			env: Vec::new(),
			reload_signal: Some(Signal::SIGHUP),
			kill_signal: Some(Signal::SIGKILL),
			start_timeout: Duration::ZERO,
			kill_timeout: DEFAULT_KILL_TIMEOUT,
			splay: Duration::ZERO,
			output: Output::Inherit,
		}
	}
}

impl ProcessOptions {
	pub fn normalized(mut self) -> Result<Self, ConfigError> {
		if self.kill_timeout.is_zero() {
			self.kill_timeout = DEFAULT_KILL_TIMEOUT;
		}
		for entry in &self.env {
			match entry.split_once('=') {
				Some((key, _)) if !key.is_empty() => {}
				_ => return Err(ConfigError::InvalidEnv(entry.clone())),
			}
		}
		Ok(self)
	}
}

/// How the managed proxy is invoked for every epoch.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
	/// Host directory holding the proxy configuration.
	pub config_path: PathBuf,
	pub config_file: String,
	pub binary: String,
	/// Run the proxy through a container runtime instead of directly.
	pub docker: bool,
	pub container_runtime: String,
	pub image: String,
	/// Where `config_path` is mounted inside the container.
	pub container_config_dir: String,
	pub drain_time: Duration,
	pub parent_shutdown_time: Duration,
	pub extra_args: Vec<String>,
}

impl Default for ProxyOptions {
	fn default() -> Self {
		Self {
			config_path: PathBuf::from("/etc/envoy"),
			config_file: "envoy.yaml".into(),
			binary: "envoy".into(),
			docker: false,
			container_runtime: "docker".into(),
			image: ENVOY_DOCKER_IMAGE.into(),
			container_config_dir: "/etc/envoy".into(),
			drain_time: DEFAULT_DRAIN_TIME,
			parent_shutdown_time: DEFAULT_PARENT_SHUTDOWN_TIME,
			extra_args: Vec::new(),
		}
	}
}

impl ProxyOptions {
	/// Fills zero durations with defaults and checks the drain window.
	pub fn normalized(mut self) -> Result<Self, ConfigError> {
		if self.binary.is_empty() {
			return Err(ConfigError::MissingCommand);
		}
		if self.docker && (self.container_runtime.is_empty() || self.image.is_empty()) {
			return Err(ConfigError::MissingCommand);
		}
		if self.drain_time.is_zero() {
			self.drain_time = DEFAULT_DRAIN_TIME;
		}
		if self.parent_shutdown_time.is_zero() {
			self.parent_shutdown_time = DEFAULT_PARENT_SHUTDOWN_TIME;
		}
		if self.parent_shutdown_time <= self.drain_time {
			return Err(ConfigError::InvalidTimeout {
				name: "parent shutdown time",
				reason: format!(
					"{:?} must be greater than drain time {:?}",
					self.parent_shutdown_time, self.drain_time
				),
			});
		}
		Ok(self)
	}
}
