use std::sync::Arc;

use reenvoy::{ExitResult, Orchestrator, OrchestratorError};

use crate::supervisor::ServiceError;

/// Runs one orchestrator as a supervised service.
#[derive(Clone)]
pub struct ProxyService {
	orchestrator: Arc<Orchestrator>,
}

impl ProxyService {
	pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
		Self { orchestrator }
	}

	/// Ensures a generation is running, then serves signals until shutdown.
	///
	/// Returns `Ok` once interrupt/terminate has stopped every child, and
	/// `Failed` if the current generation exits on its own.
	pub async fn serve(&self) -> Result<(), ServiceError> {
		let orchestrator = &self.orchestrator;

		if orchestrator.current().await.is_none() {
			orchestrator
				.restart()
				.await
				.map_err(|e| ServiceError::Fatal(format!("initial spawn failed: {}", e)))?;
		} else if !orchestrator.is_running().await {
			orchestrator.restart().await.map_err(|e| match e {
				OrchestratorError::EpochExhausted(_) => ServiceError::Fatal(e.to_string()),
				e => ServiceError::Failed(e.to_string()),
			})?;
		}

		let mut listeners = orchestrator
			.listen_for_signals()
			.map_err(|e| ServiceError::Fatal(e.to_string()))?;
		let mut epochs = orchestrator.subscribe_epoch();

		loop {
			epochs.borrow_and_update();
			let exit = orchestrator.current_exit().await;

			tokio::select! {
				received = listeners.wait_shutdown() => {
					tracing::info!("shut down by {:?}", received);
					return Ok(());
				}
				changed = epochs.changed() => {
					if changed.is_err() {
						return Err(ServiceError::Fatal("orchestrator dropped".into()));
					}
				}
				code = wait_exit(exit) => match code {
					Some(code) => {
						return Err(ServiceError::Failed(format!(
							"proxy (epoch {}) exited with code {}",
							orchestrator.restart_epoch().await.saturating_sub(1),
							code
						)));
					}
					// Stopped generations discard their exit code.
					None => {
						listeners.wait_shutdown().await;
						return Ok(());
					}
				},
			}
		}
	}
}

async fn wait_exit(exit: Option<ExitResult>) -> Option<i32> {
	match exit {
		Some(mut exit) => exit.wait().await,
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use nix::sys::signal::Signal;
	use reenvoy::{Output, ProcessOptions, ProxyOptions};
	use std::time::Duration;

	fn orchestrator(binary: &str) -> Arc<Orchestrator> {
		let proxy = ProxyOptions {
			binary: binary.into(),
			..ProxyOptions::default()
		};
		let process = ProcessOptions {
			kill_signal: Some(Signal::SIGTERM),
			kill_timeout: Duration::from_secs(1),
			output: Output::Null,
			..ProcessOptions::default()
		};
		Arc::new(Orchestrator::new(proxy, process).unwrap())
	}

	#[tokio::test]
	async fn failed_initial_spawn_is_fatal() {
		let service = ProxyService::new(orchestrator("/nonexistent/envoy"));
		let err = service.serve().await.unwrap_err();
		assert!(matches!(err, ServiceError::Fatal(_)), "got {:?}", err);
	}

	#[tokio::test]
	async fn proxy_exit_fails_the_service() {
		// `false` ignores the proxy flags and exits 1 right away.
		let orch = orchestrator("false");
		let service = ProxyService::new(Arc::clone(&orch));
		let err = tokio::time::timeout(Duration::from_secs(5), service.serve())
			.await
			.expect("serve returns")
			.unwrap_err();
		assert!(matches!(err, ServiceError::Failed(_)), "got {:?}", err);
		assert_eq!(orch.restart_epoch().await, 1);
	}

	#[tokio::test]
	async fn exhausted_epochs_end_supervision() {
		let orch = orchestrator("false");
		let orch = Arc::new(
			Arc::into_inner(orch)
				.unwrap()
				.with_initial_epoch(u32::MAX - 1),
		);
		let service = ProxyService::new(Arc::clone(&orch));
		// Epoch u32::MAX - 1 spawns and exits; the respawn has no epoch left.
		let first = service.serve().await.unwrap_err();
		assert!(matches!(first, ServiceError::Failed(_)), "got {:?}", first);
		let second = service.serve().await.unwrap_err();
		assert!(matches!(second, ServiceError::Fatal(_)), "got {:?}", second);
		assert_eq!(orch.restart_epoch().await, u32::MAX);
	}
}
