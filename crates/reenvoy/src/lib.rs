//! # reenvoy
//!
//! Hot-restart supervisor for proxies that speak the Envoy restart protocol.
//!
//! A [`ProcessHandle`] owns one OS process: start, signal, graceful kill with
//! escalation, and exit-code delivery. The [`Orchestrator`] keeps the current
//! generation and, during a drain window, the previous one, handing each new
//! spawn a strictly increasing restart epoch.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reenvoy::{Orchestrator, ProcessOptions, ProxyOptions};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let proxy = ProxyOptions {
//!     config_path: "/etc/envoy".into(),
//!     ..ProxyOptions::default()
//! };
//! let orchestrator = Arc::new(Orchestrator::new(proxy, ProcessOptions::default()).unwrap());
//!
//! orchestrator.restart().await.unwrap();
//! let mut listeners = orchestrator.listen_for_signals().unwrap();
//! listeners.wait_shutdown().await;
//! # }
//! ```

pub mod env;
pub mod error;
pub mod options;
pub mod orchestrator;
pub mod output;
pub mod process;
pub mod spawn;
pub mod splay;

pub use env::Environment;
pub use error::{ConfigError, OrchestratorError, ProcessError};
pub use options::{ProcessOptions, ProxyOptions};
pub use orchestrator::{route_signal, Orchestrator, OrchestratorStatus, SignalAction, SignalListeners};
pub use output::{Output, OutputCapture};
pub use process::{ExitResult, ProcessHandle, EXIT_CODE_ERROR, EXIT_CODE_OK};
pub use spawn::{build_command, SpawnCommand};
