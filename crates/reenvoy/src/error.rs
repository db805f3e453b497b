use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Rejected before any process is spawned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("missing command")]
	MissingCommand,
	#[error("invalid {name}: {reason}")]
	InvalidTimeout { name: &'static str, reason: String },
	#[error("invalid environment entry {0:?}: expected key=value")]
	InvalidEnv(String),
}

#[derive(Debug, Error)]
pub enum ProcessError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("failed to spawn {command}: {source}")]
	Spawn {
		command: String,
		#[source]
		source: io::Error,
	},
	#[error("command {command} did not exit within {timeout:?}")]
	StartTimeout { command: String, timeout: Duration },
	#[error("command {command} exited with a non-zero exit status ({code})")]
	NonZeroExit { command: String, code: i32 },
	#[error("failed to send {signal} to pid {pid}: {source}")]
	Signal {
		pid: u32,
		signal: Signal,
		#[source]
		source: Errno,
	},
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
	#[error(transparent)]
	Process(#[from] ProcessError),
	#[error("failed to register signal handler: {0}")]
	Signals(#[source] io::Error),
	#[error("restart epoch {0} is the last one, cannot restart again")]
	EpochExhausted(u32),
}

impl From<ConfigError> for OrchestratorError {
	fn from(e: ConfigError) -> Self {
		OrchestratorError::Process(ProcessError::Config(e))
	}
}
