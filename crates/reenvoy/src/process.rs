use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::error::{ConfigError, ProcessError};
use crate::options::ProcessOptions;
use crate::output::{pipe_output, Output};
use crate::splay::random_splay;

/// Exit code for a clean exit.
pub const EXIT_CODE_OK: i32 = 0;

/// Exit code reported when the OS status cannot be decoded.
pub const EXIT_CODE_ERROR: i32 = 127;

/// Single-slot cell that receives the exit code of one process run.
///
/// Every successful start installs a fresh cell, so callers must fetch it
/// again after a restart instead of holding on to an old one.
#[derive(Debug, Clone)]
pub struct ExitResult {
	rx: watch::Receiver<Option<i32>>,
}

impl ExitResult {
	fn empty() -> Self {
		let (_, rx) = watch::channel(None);
		Self { rx }
	}

	/// The exit code, if it has been delivered.
	pub fn code(&self) -> Option<i32> {
		*self.rx.borrow()
	}

	/// Waits for the exit code. Returns `None` when the result was discarded
	/// because the handle was stopped, or when nothing was ever started.
	pub async fn wait(&mut self) -> Option<i32> {
		match self.rx.wait_for(Option::is_some).await {
			Ok(code) => *code,
			Err(_) => None,
		}
	}
}

#[derive(Clone)]
struct Running {
	pid: u32,
	// Always fed by the exit watcher, even after stop. Internal only.
	exited: watch::Receiver<Option<i32>>,
}

impl Running {
	fn has_exited(&self) -> bool {
		self.exited.borrow().is_some()
	}
}

struct Slot {
	running: Option<Running>,
	exit: ExitResult,
}

/// One managed OS process.
///
/// Start, kill and restart are serialized by an internal lock; pid, status
/// and exit-result queries never wait on them.
pub struct ProcessHandle {
	command: String,
	args: Vec<String>,
	options: ProcessOptions,
	lifecycle: Mutex<()>,
	slot: RwLock<Slot>,
	// One-way. Set by stop(): interrupts splays and discards exit results.
	stopping: watch::Sender<bool>,
	stop_lock: Mutex<()>,
}

impl ProcessHandle {
	pub fn new(
		command: impl Into<String>,
		args: Vec<String>,
		options: ProcessOptions,
	) -> Result<Self, ConfigError> {
		let command = command.into();
		if command.is_empty() {
			return Err(ConfigError::MissingCommand);
		}
		let options = options.normalized()?;
		let (stopping, _) = watch::channel(false);
		Ok(Self {
			command,
			args,
			options,
			lifecycle: Mutex::new(()),
			slot: RwLock::new(Slot {
				running: None,
				exit: ExitResult::empty(),
			}),
			stopping,
			stop_lock: Mutex::new(()),
		})
	}

	pub fn command(&self) -> &str {
		&self.command
	}

	pub fn args(&self) -> &[String] {
		&self.args
	}

	pub fn options(&self) -> &ProcessOptions {
		&self.options
	}

	/// Launches the process. Any process still running on this handle is
	/// killed first. With a start timeout, waits for the command to finish.
	pub async fn start(&self) -> Result<(), ProcessError> {
		if self.is_stopped() {
			tracing::warn!("{}: start ignored, handle is stopped", self.command);
			return Ok(());
		}
		let Some(_guard) = self.lock_unless_stopped("start").await else {
			return Ok(());
		};
		self.start_locked().await
	}

	/// Reloads in place with the reload signal if one is configured,
	/// otherwise kills and starts again.
	pub async fn restart(&self) -> Result<(), ProcessError> {
		if self.is_stopped() {
			tracing::warn!("{}: restart ignored, handle is stopped", self.command);
			return Ok(());
		}

		let Some(reload_signal) = self.options.reload_signal else {
			tracing::info!("restarting {}", self.command);
			let Some(_guard) = self.lock_unless_stopped("restart").await else {
				return Ok(());
			};
			return self.start_locked().await;
		};

		tracing::info!("reloading {}", self.command);
		let Some(running) = self.running() else {
			return Ok(());
		};
		let mut exited = running.exited.clone();
		self.wait_splay(&mut exited).await;
		if self.is_stopped() {
			return Ok(());
		}
		self.signal(reload_signal)
	}

	/// Sends `signal` to the running process. Does nothing if nothing runs.
	pub fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
		let pid = self.pid();
		if pid == 0 {
			return Ok(());
		}
		tracing::info!("sending {} to {} (pid {})", signal, self.command, pid);
		send_signal(pid, signal)
	}

	/// Terminates the process and returns once it is gone.
	///
	/// Sends the kill signal after a random splay and waits up to the kill
	/// timeout; if the process is still alive, or no kill signal is set, it
	/// is SIGKILLed.
	pub async fn kill(&self) {
		if self.is_stopped() {
			tracing::debug!("{}: kill ignored, handle is stopped", self.command);
			return;
		}
		let Some(_guard) = self.lock_unless_stopped("kill").await else {
			return;
		};
		self.terminate().await;
	}

	/// Kills the process for good. The handle never starts again and the
	/// exit code of the killed process is not delivered.
	pub async fn stop(&self) {
		let _guard = self.stop_lock.lock().await;
		if self.stopping.send_replace(true) {
			tracing::warn!("{}: process already stopped", self.command);
			return;
		}
		tracing::info!("stopping {}", self.command);
		let _lifecycle = self.lifecycle.lock().await;
		self.terminate().await;
	}

	pub fn is_stopped(&self) -> bool {
		*self.stopping.borrow()
	}

	pub fn is_running(&self) -> bool {
		self.running().is_some_and(|r| !r.has_exited())
	}

	/// OS pid while running, 0 otherwise.
	pub fn pid(&self) -> u32 {
		match self.running() {
			Some(r) if !r.has_exited() => r.pid,
			_ => 0,
		}
	}

	pub fn exit_result(&self) -> ExitResult {
		self.slot().exit.clone()
	}

	// A stop may have slipped in while we waited for the lock.
	async fn lock_unless_stopped(&self, op: &str) -> Option<MutexGuard<'_, ()>> {
		let guard = self.lifecycle.lock().await;
		if self.is_stopped() {
			tracing::debug!("{}: {} ignored, handle was stopped meanwhile", self.command, op);
			return None;
		}
		Some(guard)
	}

	fn running(&self) -> Option<Running> {
		self.slot().running.clone()
	}

	fn slot(&self) -> RwLockReadGuard<'_, Slot> {
		self.slot.read().unwrap_or_else(|p| p.into_inner())
	}

	fn slot_mut(&self) -> RwLockWriteGuard<'_, Slot> {
		self.slot.write().unwrap_or_else(|p| p.into_inner())
	}

	async fn start_locked(&self) -> Result<(), ProcessError> {
		if self.running().is_some() {
			self.terminate().await;
		}

		let mut cmd = Command::new(&self.command);
		cmd.args(&self.args)
			.stdin(Stdio::null())
			.stdout(self.options.output.stdio())
			.stderr(self.options.output.stdio());

		if !self.options.env.is_empty() {
			cmd.env_clear();
			for entry in &self.options.env {
				if let Some((key, value)) = entry.split_once('=') {
					cmd.env(key, value);
				}
			}
		}

		let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
			command: self.command.clone(),
			source,
		})?;
		let pid = child.id().unwrap_or(0);
		tracing::info!("started {} (pid {})", self.command, pid);

		if let Output::Capture(capture) = &self.options.output {
			if let Some(stdout) = child.stdout.take() {
				tokio::spawn(pipe_output(stdout, capture.clone()));
			}
			if let Some(stderr) = child.stderr.take() {
				tokio::spawn(pipe_output(stderr, capture.clone()));
			}
		}

		let (exited_tx, exited_rx) = watch::channel(None);
		let (result_tx, result_rx) = watch::channel(None);
		let stopping = self.stopping.subscribe();
		let command = self.command.clone();

		tokio::spawn(async move {
			let code = match child.wait().await {
				Ok(status) => exit_code(status),
				Err(e) => {
					tracing::warn!("{} (pid {}): wait failed: {}", command, pid, e);
					EXIT_CODE_ERROR
				}
			};
			tracing::debug!("{} (pid {}) exited with {}", command, pid, code);
			exited_tx.send_replace(Some(code));

			if *stopping.borrow() {
				tracing::debug!("{} (pid {}): stopped, discarding exit code", command, pid);
				return;
			}
			result_tx.send_replace(Some(code));
		});

		let running = Running {
			pid,
			exited: exited_rx,
		};
		{
			let mut slot = self.slot_mut();
			slot.running = Some(running.clone());
			slot.exit = ExitResult { rx: result_rx };
		}

		let timeout = self.options.start_timeout;
		if timeout.is_zero() {
			return Ok(());
		}

		let mut exit = self.exit_result();
		match tokio::time::timeout(timeout, exit.wait()).await {
			Ok(Some(EXIT_CODE_OK)) | Ok(None) => Ok(()),
			Ok(Some(code)) => Err(ProcessError::NonZeroExit {
				command: self.command.clone(),
				code,
			}),
			Err(_) => {
				tracing::warn!("{} did not exit within {:?}, killing", self.command, timeout);
				let mut exited = running.exited.clone();
				force_kill(pid, &mut exited).await;
				self.slot_mut().running = None;
				Err(ProcessError::StartTimeout {
					command: self.command.clone(),
					timeout,
				})
			}
		}
	}

	// Caller holds the lifecycle lock.
	async fn terminate(&self) {
		let Some(running) = self.running() else {
			return;
		};
		let pid = running.pid;
		let mut exited = running.exited.clone();

		if running.has_exited() {
			tracing::debug!("{} (pid {}) already exited, not waiting for splay", self.command, pid);
		} else {
			tracing::info!("killing {} (pid {})", self.command, pid);
			if let Some(kill_signal) = self.options.kill_signal {
				self.wait_splay(&mut exited).await;
				if !has_exited(&exited) {
					match send_signal(pid, kill_signal) {
						Ok(()) => {
							let graceful = tokio::time::timeout(
								self.options.kill_timeout,
								wait_exit(&mut exited),
							)
							.await
							.is_ok();
							if !graceful {
								tracing::warn!(
									"{} (pid {}) ignored {} for {:?}, escalating",
									self.command,
									pid,
									kill_signal,
									self.options.kill_timeout
								);
							}
						}
						Err(e) => tracing::debug!("{}", e),
					}
				}
			}
			if !has_exited(&exited) {
				force_kill(pid, &mut exited).await;
			}
		}

		self.slot_mut().running = None;
	}

	async fn wait_splay(&self, exited: &mut watch::Receiver<Option<i32>>) {
		let delay = random_splay(self.options.splay);
		if delay.is_zero() {
			return;
		}
		tracing::debug!("{}: waiting {:.2}s for random splay", self.command, delay.as_secs_f64());
		let mut stopping = self.stopping.subscribe();
		tokio::select! {
			_ = tokio::time::sleep(delay) => {}
			_ = stopping.wait_for(|s| *s) => {}
			_ = exited.wait_for(Option::is_some) => {}
		}
	}
}

fn exit_code(status: ExitStatus) -> i32 {
	match (status.code(), status.signal()) {
		(Some(code), _) => code,
		(None, Some(sig)) => 128 + sig,
		(None, None) => EXIT_CODE_ERROR,
	}
}

fn has_exited(exited: &watch::Receiver<Option<i32>>) -> bool {
	exited.borrow().is_some()
}

async fn wait_exit(exited: &mut watch::Receiver<Option<i32>>) {
	let _ = exited.wait_for(Option::is_some).await;
}

async fn force_kill(pid: u32, exited: &mut watch::Receiver<Option<i32>>) {
	if has_exited(exited) {
		return;
	}
	if let Err(e) = send_signal(pid, Signal::SIGKILL) {
		tracing::debug!("{}", e);
	}
	wait_exit(exited).await;
}

fn send_signal(pid: u32, sig: Signal) -> Result<(), ProcessError> {
	if pid == 0 {
		return Ok(());
	}
	signal::kill(Pid::from_raw(pid as i32), sig).map_err(|source| ProcessError::Signal {
		pid,
		signal: sig,
		source,
	})
}
