use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
	/// The service cannot run at all; supervision gives up.
	#[error("{0}")]
	Fatal(String),
	/// The service stopped unexpectedly and should be run again.
	#[error("{0}")]
	Failed(String),
}

#[derive(Debug, Clone)]
pub struct SupervisorSpec {
	pub failure_threshold: u32,
	/// Half-life of the failure count.
	pub failure_decay: Duration,
	pub failure_backoff: Duration,
}

/// Keeps one long-lived service running, restarting it after failures or
/// panics and backing off when it fails too often.
pub struct Supervisor {
	name: String,
	spec: SupervisorSpec,
	failures: f64,
	last_failure: Option<Instant>,
}

impl Supervisor {
	pub fn new(name: impl Into<String>, spec: SupervisorSpec) -> Self {
		Self {
			name: name.into(),
			spec,
			failures: 0.0,
			last_failure: None,
		}
	}

	pub async fn run<F, Fut>(&mut self, mut service: F) -> Result<(), ServiceError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
	{
		loop {
			match tokio::spawn(service()).await {
				Ok(Ok(())) => {
					tracing::info!("{}: finished", self.name);
					return Ok(());
				}
				Ok(Err(ServiceError::Fatal(msg))) => {
					tracing::error!("{}: {}", self.name, msg);
					return Err(ServiceError::Fatal(msg));
				}
				Ok(Err(ServiceError::Failed(msg))) => {
					tracing::warn!("{}: failed: {}", self.name, msg);
				}
				Err(e) if e.is_panic() => {
					tracing::error!("{}: panicked, restarting", self.name);
				}
				Err(e) => {
					return Err(ServiceError::Fatal(format!("{}: {}", self.name, e)));
				}
			}

			if self.record_failure(Instant::now()) {
				tracing::warn!(
					"{}: more than {} failures, backing off for {:?}",
					self.name,
					self.spec.failure_threshold,
					self.spec.failure_backoff
				);
				tokio::time::sleep(self.spec.failure_backoff).await;
				self.failures = 0.0;
				self.last_failure = None;
			}
		}
	}

	/// Returns true when the decayed failure count exceeds the threshold.
	fn record_failure(&mut self, now: Instant) -> bool {
		if let Some(last) = self.last_failure {
			let decay = self.spec.failure_decay.as_secs_f64();
			if decay > 0.0 {
				let intervals = now.duration_since(last).as_secs_f64() / decay;
				self.failures *= 0.5f64.powf(intervals);
			}
		}
		self.failures += 1.0;
		self.last_failure = Some(now);
		self.failures > f64::from(self.spec.failure_threshold)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Arc;

	fn spec(threshold: u32) -> SupervisorSpec {
		SupervisorSpec {
			failure_threshold: threshold,
			failure_decay: Duration::from_secs(30),
			failure_backoff: Duration::from_millis(10),
		}
	}

	#[test]
	fn failures_over_threshold_trigger_backoff() {
		let mut sup = Supervisor::new("test", spec(3));
		let now = Instant::now();
		assert!(!sup.record_failure(now));
		assert!(!sup.record_failure(now));
		assert!(!sup.record_failure(now));
		assert!(sup.record_failure(now));
	}

	#[test]
	fn failures_decay_over_time() {
		let mut sup = Supervisor::new("test", spec(2));
		let start = Instant::now();
		assert!(!sup.record_failure(start));
		// Two half-lives later the first failure counts for a quarter.
		assert!(!sup.record_failure(start + Duration::from_secs(60)));
		assert!((sup.failures - 1.25).abs() < 1e-9);
	}

	#[tokio::test]
	async fn restarts_until_success() {
		let attempts = Arc::new(AtomicU32::new(0));
		let mut sup = Supervisor::new("test", spec(1));
		let counter = Arc::clone(&attempts);
		let result = sup
			.run(move || {
				let counter = Arc::clone(&counter);
				async move {
					if counter.fetch_add(1, Ordering::SeqCst) < 3 {
						Err(ServiceError::Failed("boom".into()))
					} else {
						Ok(())
					}
				}
			})
			.await;
		assert!(result.is_ok());
		assert_eq!(attempts.load(Ordering::SeqCst), 4);
	}

	#[tokio::test]
	async fn panics_are_restarted() {
		let attempts = Arc::new(AtomicU32::new(0));
		let mut sup = Supervisor::new("test", spec(5));
		let counter = Arc::clone(&attempts);
		let result = sup
			.run(move || {
				let counter = Arc::clone(&counter);
				async move {
					if counter.fetch_add(1, Ordering::SeqCst) == 0 {
						panic!("first run panics");
					}
					Ok::<(), ServiceError>(())
				}
			})
			.await;
		assert!(result.is_ok());
		assert_eq!(attempts.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn fatal_errors_stop_supervision() {
		let attempts = Arc::new(AtomicU32::new(0));
		let mut sup = Supervisor::new("test", spec(5));
		let counter = Arc::clone(&attempts);
		let result = sup
			.run(move || {
				let counter = Arc::clone(&counter);
				async move {
					counter.fetch_add(1, Ordering::SeqCst);
					Err::<(), _>(ServiceError::Fatal("no binary".into()))
				}
			})
			.await;
		assert!(matches!(result, Err(ServiceError::Fatal(_))));
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}
}
