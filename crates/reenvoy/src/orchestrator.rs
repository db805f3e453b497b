use std::sync::{Arc, RwLock as StdRwLock};

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::env::{Environment, RESTART_EPOCH_VAR};
use crate::error::{ConfigError, OrchestratorError};
use crate::options::{ProcessOptions, ProxyOptions};
use crate::process::{ExitResult, ProcessHandle};
use crate::spawn::{build_command, SpawnCommand};

/// What a received OS signal means for the managed proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
	StopAll,
	Restart,
	Log,
}

pub fn route_signal(sig: Signal) -> SignalAction {
	match sig {
		Signal::SIGINT | Signal::SIGTERM => SignalAction::StopAll,
		Signal::SIGHUP => SignalAction::Restart,
		_ => SignalAction::Log,
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStatus {
	/// Epoch the next successful restart will use.
	pub restart_epoch: u32,
	pub current_pid: u32,
	pub parent_pid: u32,
	pub running: bool,
}

struct Generations {
	current: Option<Arc<ProcessHandle>>,
	parent: Option<Arc<ProcessHandle>>,
	restart_epoch: u32,
}

/// Hot-restart orchestrator: owns the current proxy generation and, until
/// the next restart or shutdown, the one it replaced.
pub struct Orchestrator {
	proxy: ProxyOptions,
	process: ProcessOptions,
	pristine: bool,
	environment: StdRwLock<Environment>,
	generations: RwLock<Generations>,
	epoch_tx: watch::Sender<u32>,
}

impl Orchestrator {
	pub fn new(proxy: ProxyOptions, process: ProcessOptions) -> Result<Self, ConfigError> {
		let proxy = proxy.normalized()?;
		let mut process = process.normalized()?;

		let mut environment = Environment::new();
		for entry in process.env.drain(..) {
			if let Some((key, value)) = entry.split_once('=') {
				environment.insert(key, value);
			}
		}

		let (epoch_tx, _) = watch::channel(0);
		Ok(Self {
			proxy,
			process,
			pristine: false,
			environment: StdRwLock::new(environment),
			generations: RwLock::new(Generations {
				current: None,
				parent: None,
				restart_epoch: 0,
			}),
			epoch_tx,
		})
	}

	/// Start counting from `epoch` instead of 0.
	pub fn with_initial_epoch(mut self, epoch: u32) -> Self {
		self.generations.get_mut().restart_epoch = epoch;
		self.epoch_tx.send_replace(epoch);
		self
	}

	/// Children get only our overlay and `RESTART_EPOCH`, nothing inherited.
	pub fn pristine(mut self, pristine: bool) -> Self {
		self.pristine = pristine;
		self
	}

	pub fn proxy_options(&self) -> &ProxyOptions {
		&self.proxy
	}

	/// Replaces the variables handed to future generations. Returns false if
	/// nothing changed, in which case no restart is needed.
	pub fn set_environment(&self, env: Environment) -> bool {
		let mut current = self.environment.write().unwrap_or_else(|p| p.into_inner());
		if *current == env {
			tracing::info!("environment unchanged");
			return false;
		}
		*current = env;
		true
	}

	/// Command line the next restart would run.
	pub async fn next_command(&self) -> SpawnCommand {
		let epoch = self.generations.read().await.restart_epoch;
		build_command(&self.proxy, epoch)
	}

	/// Spawns the next generation. On success the previous current becomes
	/// the parent and the epoch advances; on failure nothing changes.
	pub async fn restart(&self) -> Result<u32, OrchestratorError> {
		let mut gens = self.generations.write().await;
		let epoch = gens.restart_epoch;
		let Some(next_epoch) = epoch.checked_add(1) else {
			tracing::error!("restart epoch {} cannot advance", epoch);
			return Err(OrchestratorError::EpochExhausted(epoch));
		};
		let command = build_command(&self.proxy, epoch);

		tracing::info!("forking and execing new child process at epoch {}", epoch);
		tracing::debug!("epoch {} command: {}", epoch, command);

		let options = ProcessOptions {
			env: self.compose_env(epoch),
			..self.process.clone()
		};
		let handle = Arc::new(ProcessHandle::new(command.program, command.args, options)?);
		if let Err(e) = handle.start().await {
			tracing::error!("restart at epoch {} failed: {}", epoch, e);
			return Err(e.into());
		}

		// The proxy only hands off between two generations; anything older
		// must not be left running unreferenced.
		if let Some(oldest) = gens.parent.take() {
			tracing::info!("retiring generation (pid {}) before epoch {}", oldest.pid(), epoch);
			oldest.stop().await;
		}

		gens.parent = gens.current.take();
		gens.current = Some(handle);
		gens.restart_epoch = next_epoch;
		self.epoch_tx.send_replace(gens.restart_epoch);

		tracing::info!(
			"epoch {} running (pid {}), parent pid {}",
			epoch,
			gens.current.as_ref().map_or(0, |c| c.pid()),
			gens.parent.as_ref().map_or(0, |p| p.pid())
		);
		Ok(epoch)
	}

	/// Stops the parent, then the current generation. Best effort.
	pub async fn stop_all_children(&self) {
		let mut gens = self.generations.write().await;
		if let Some(parent) = gens.parent.take() {
			tracing::info!("stopping parent generation (pid {})", parent.pid());
			parent.stop().await;
		}
		if let Some(current) = gens.current.take() {
			tracing::info!("stopping current generation (pid {})", current.pid());
			current.stop().await;
		}
	}

	/// Same traversal as [`stop_all_children`](Self::stop_all_children) but
	/// kills without marking the handles stopped.
	pub async fn force_kill_all_children(&self) {
		let gens = self.generations.write().await;
		if let Some(parent) = &gens.parent {
			tracing::info!("killing parent generation (pid {})", parent.pid());
			parent.kill().await;
		}
		if let Some(current) = &gens.current {
			tracing::info!("killing current generation (pid {})", current.pid());
			current.kill().await;
		}
	}

	pub async fn is_running(&self) -> bool {
		let gens = self.generations.read().await;
		gens.current.as_ref().is_some_and(|c| c.is_running())
	}

	/// Pid of the current generation, 0 when nothing runs.
	pub async fn pid(&self) -> u32 {
		let gens = self.generations.read().await;
		gens.current.as_ref().map_or(0, |c| c.pid())
	}

	pub async fn restart_epoch(&self) -> u32 {
		self.generations.read().await.restart_epoch
	}

	pub async fn current(&self) -> Option<Arc<ProcessHandle>> {
		self.generations.read().await.current.clone()
	}

	pub async fn parent(&self) -> Option<Arc<ProcessHandle>> {
		self.generations.read().await.parent.clone()
	}

	/// Exit cell of the current generation.
	pub async fn current_exit(&self) -> Option<ExitResult> {
		let gens = self.generations.read().await;
		gens.current.as_ref().map(|c| c.exit_result())
	}

	/// Yields the next epoch after every successful restart.
	pub fn subscribe_epoch(&self) -> watch::Receiver<u32> {
		self.epoch_tx.subscribe()
	}

	pub async fn status(&self) -> OrchestratorStatus {
		let gens = self.generations.read().await;
		OrchestratorStatus {
			restart_epoch: gens.restart_epoch,
			current_pid: gens.current.as_ref().map_or(0, |c| c.pid()),
			parent_pid: gens.parent.as_ref().map_or(0, |p| p.pid()),
			running: gens.current.as_ref().is_some_and(|c| c.is_running()),
		}
	}

	/// Applies the routing table to one received signal.
	pub async fn handle_signal(&self, sig: Signal) {
		tracing::info!("received signal {}", sig);
		match route_signal(sig) {
			SignalAction::StopAll => self.stop_all_children().await,
			SignalAction::Restart => {
				if let Err(e) = self.restart().await {
					tracing::error!("hot restart failed, previous generation keeps serving: {}", e);
				}
			}
			SignalAction::Log => {
				if sig == Signal::SIGUSR1 {
					let status = self.status().await;
					tracing::info!(
						restart_epoch = status.restart_epoch,
						current_pid = status.current_pid,
						parent_pid = status.parent_pid,
						running = status.running,
						"status"
					);
				} else {
					tracing::debug!("{}: nothing to do", sig);
				}
			}
		}
	}

	/// Installs one listener task per signal group.
	///
	/// Interrupt/terminate is one-shot: it stops all children and resolves
	/// [`SignalListeners::wait_shutdown`]. Hang-up keeps listening and
	/// triggers a hot restart each time.
	pub fn listen_for_signals(self: &Arc<Self>) -> Result<SignalListeners, OrchestratorError> {
		let mut interrupt = signal(SignalKind::interrupt()).map_err(OrchestratorError::Signals)?;
		let mut terminate = signal(SignalKind::terminate()).map_err(OrchestratorError::Signals)?;
		let mut hangup = signal(SignalKind::hangup()).map_err(OrchestratorError::Signals)?;
		let mut child = signal(SignalKind::child()).map_err(OrchestratorError::Signals)?;
		let mut user1 = signal(SignalKind::user_defined1()).map_err(OrchestratorError::Signals)?;

		let orchestrator = Arc::clone(self);
		let shutdown = tokio::spawn(async move {
			let received = tokio::select! {
				_ = interrupt.recv() => Signal::SIGINT,
				_ = terminate.recv() => Signal::SIGTERM,
			};
			orchestrator.handle_signal(received).await;
			received
		});

		let orchestrator = Arc::clone(self);
		let reload = tokio::spawn(async move {
			while hangup.recv().await.is_some() {
				orchestrator.handle_signal(Signal::SIGHUP).await;
			}
		});

		let orchestrator = Arc::clone(self);
		let info = tokio::spawn(async move {
			loop {
				let received = tokio::select! {
					Some(()) = child.recv() => Signal::SIGCHLD,
					Some(()) = user1.recv() => Signal::SIGUSR1,
					else => break,
				};
				orchestrator.handle_signal(received).await;
			}
		});

		Ok(SignalListeners {
			shutdown,
			background: vec![reload, info],
		})
	}

	fn compose_env(&self, epoch: u32) -> Vec<String> {
		let mut env = self
			.environment
			.read()
			.unwrap_or_else(|p| p.into_inner())
			.clone();
		env.insert(RESTART_EPOCH_VAR, epoch.to_string());
		env.compose(self.pristine)
	}
}

/// Running signal listener tasks. Dropping this aborts them.
pub struct SignalListeners {
	shutdown: JoinHandle<Signal>,
	background: Vec<JoinHandle<()>>,
}

impl SignalListeners {
	/// Resolves after an interrupt or terminate signal has been handled,
	/// i.e. once all children are stopped.
	pub async fn wait_shutdown(&mut self) -> Option<Signal> {
		let received = (&mut self.shutdown).await.ok();
		for task in &self.background {
			task.abort();
		}
		received
	}
}

impl Drop for SignalListeners {
	fn drop(&mut self) {
		self.shutdown.abort();
		for task in &self.background {
			task.abort();
		}
	}
}
