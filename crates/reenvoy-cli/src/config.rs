use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use reenvoy::options::{
	DEFAULT_DRAIN_TIME, DEFAULT_KILL_TIMEOUT, DEFAULT_PARENT_SHUTDOWN_TIME, ENVOY_DOCKER_IMAGE,
};
use reenvoy::{Environment, Output, OutputCapture, ProcessOptions, ProxyOptions};
use serde::Deserialize;

use crate::supervisor::SupervisorSpec;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
	#[serde(default)]
	pub proxy: ProxyConfig,
	#[serde(default)]
	pub process: ProcessConfig,
	#[serde(default)]
	pub supervisor: SupervisorConfig,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
	#[serde(default = "default_config_path")]
	pub config_path: PathBuf,
	#[serde(default = "default_config_file")]
	pub config_file: String,
	#[serde(default = "default_binary")]
	pub binary: String,
	#[serde(default)]
	pub docker: bool,
	#[serde(default = "default_container_runtime")]
	pub container_runtime: String,
	#[serde(default = "default_image")]
	pub image: String,
	#[serde(default = "default_container_config_dir")]
	pub container_config_dir: String,
	#[serde(default = "default_drain_time")]
	pub drain_time_secs: u64,
	#[serde(default = "default_parent_shutdown_time")]
	pub parent_shutdown_time_secs: u64,
	#[serde(default)]
	pub extra_args: Vec<String>,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			config_path: default_config_path(),
			config_file: default_config_file(),
			binary: default_binary(),
			docker: false,
			container_runtime: default_container_runtime(),
			image: default_image(),
			container_config_dir: default_container_config_dir(),
			drain_time_secs: default_drain_time(),
			parent_shutdown_time_secs: default_parent_shutdown_time(),
			extra_args: Vec::new(),
		}
	}
}

fn default_config_path() -> PathBuf {
	PathBuf::from("/etc/envoy")
}
fn default_config_file() -> String {
	"envoy.yaml".into()
}
fn default_binary() -> String {
	"envoy".into()
}
fn default_container_runtime() -> String {
	"docker".into()
}
fn default_image() -> String {
	ENVOY_DOCKER_IMAGE.into()
}
fn default_container_config_dir() -> String {
	"/etc/envoy".into()
}
fn default_drain_time() -> u64 {
	DEFAULT_DRAIN_TIME.as_secs()
}
fn default_parent_shutdown_time() -> u64 {
	DEFAULT_PARENT_SHUTDOWN_TIME.as_secs()
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
	#[default]
	Inherit,
	Null,
	Capture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
	#[serde(default = "default_kill_signal")]
	pub kill_signal: String,
	pub reload_signal: Option<String>,
	#[serde(default = "default_kill_timeout")]
	pub kill_timeout_ms: u64,
	#[serde(default)]
	pub splay_ms: u64,
	#[serde(default)]
	pub start_timeout_ms: u64,
	#[serde(default)]
	pub pristine: bool,
	#[serde(default)]
	pub output: OutputMode,
	pub log_file: Option<PathBuf>,
}

impl Default for ProcessConfig {
	fn default() -> Self {
		Self {
			kill_signal: default_kill_signal(),
			reload_signal: None,
			kill_timeout_ms: default_kill_timeout(),
			splay_ms: 0,
			start_timeout_ms: 0,
			pristine: false,
			output: OutputMode::Inherit,
			log_file: None,
		}
	}
}

fn default_kill_signal() -> String {
	"SIGTERM".into()
}
fn default_kill_timeout() -> u64 {
	DEFAULT_KILL_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,
	#[serde(default = "default_failure_decay")]
	pub failure_decay_secs: u64,
	#[serde(default = "default_failure_backoff")]
	pub failure_backoff_secs: u64,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			failure_threshold: default_failure_threshold(),
			failure_decay_secs: default_failure_decay(),
			failure_backoff_secs: default_failure_backoff(),
		}
	}
}

fn default_failure_threshold() -> u32 {
	3
}
fn default_failure_decay() -> u64 {
	30
}
fn default_failure_backoff() -> u64 {
	15
}

pub fn config_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		PathBuf::from(dir).join("reenvoy")
	} else if let Ok(home) = std::env::var("HOME") {
		PathBuf::from(home).join(".config").join("reenvoy")
	} else {
		PathBuf::from("/etc/reenvoy")
	}
}

/// Loads `explicit` if given (it must exist), otherwise the default config
/// file when present, otherwise defaults.
pub fn load(explicit: Option<&Path>) -> Result<Config, String> {
	let path = match explicit {
		Some(p) => p.to_path_buf(),
		None => {
			let p = config_dir().join("config.toml");
			if !p.exists() {
				return Ok(Config::default());
			}
			p
		}
	};
	let content = std::fs::read_to_string(&path)
		.map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
	parse(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
}

pub fn parse(content: &str) -> Result<Config, toml::de::Error> {
	toml::from_str(content)
}

impl Config {
	pub fn proxy_options(&self) -> ProxyOptions {
		let p = &self.proxy;
		ProxyOptions {
			config_path: p.config_path.clone(),
			config_file: p.config_file.clone(),
			binary: p.binary.clone(),
			docker: p.docker,
			container_runtime: p.container_runtime.clone(),
			image: p.image.clone(),
			container_config_dir: p.container_config_dir.clone(),
			drain_time: Duration::from_secs(p.drain_time_secs),
			parent_shutdown_time: Duration::from_secs(p.parent_shutdown_time_secs),
			extra_args: p.extra_args.clone(),
		}
	}

	pub fn process_options(&self) -> Result<ProcessOptions, String> {
		let p = &self.process;
		let output = match p.output {
			OutputMode::Inherit => Output::Inherit,
			OutputMode::Null => Output::Null,
			OutputMode::Capture => Output::Capture(match &p.log_file {
				Some(path) => OutputCapture::with_log_file(path),
				None => OutputCapture::new(),
			}),
		};
		Ok(ProcessOptions {
			env: Vec::new(),
			reload_signal: p.reload_signal.as_deref().map(parse_signal).transpose()?,
			kill_signal: Some(parse_signal(&p.kill_signal)?),
			start_timeout: Duration::from_millis(p.start_timeout_ms),
			kill_timeout: Duration::from_millis(p.kill_timeout_ms),
			splay: Duration::from_millis(p.splay_ms),
			output,
		})
	}

	pub fn environment(&self) -> Environment {
		self.env.iter().collect()
	}

	pub fn supervisor_spec(&self) -> SupervisorSpec {
		SupervisorSpec {
			failure_threshold: self.supervisor.failure_threshold,
			failure_decay: Duration::from_secs(self.supervisor.failure_decay_secs),
			failure_backoff: Duration::from_secs(self.supervisor.failure_backoff_secs),
		}
	}
}

/// Accepts `SIGTERM`, `TERM` or `term`.
pub fn parse_signal(name: &str) -> Result<Signal, String> {
	let upper = name.trim().to_ascii_uppercase();
	let full = if upper.starts_with("SIG") {
		upper
	} else {
		format!("SIG{}", upper)
	};
	Signal::from_str(&full).map_err(|_| format!("unknown signal: {}", name))
}
