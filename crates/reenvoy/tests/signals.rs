// Raises real signals at the test process, so it lives in its own binary.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use reenvoy::{Orchestrator, Output, ProcessOptions, ProxyOptions};

fn fake_proxy() -> (std::path::PathBuf, std::path::PathBuf) {
	let dir = std::env::temp_dir().join(format!("reenvoy-signals-{}", std::process::id()));
	let _ = std::fs::create_dir_all(&dir);
	let path = dir.join("fake-envoy");
	std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
	std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
	(dir, path)
}

#[tokio::test]
async fn os_signals_drive_the_orchestrator() {
	let (dir, binary) = fake_proxy();
	let proxy = ProxyOptions {
		config_path: dir.clone(),
		binary: binary.display().to_string(),
		..ProxyOptions::default()
	};
	let process = ProcessOptions {
		kill_signal: Some(Signal::SIGTERM),
		kill_timeout: Duration::from_secs(2),
		output: Output::Null,
		..ProcessOptions::default()
	};
	let orch = Arc::new(Orchestrator::new(proxy, process).unwrap());
	orch.restart().await.unwrap();

	let mut listeners = orch.listen_for_signals().unwrap();
	let mut epochs = orch.subscribe_epoch();

	// Hang-up re-arms: two in a row give two restarts.
	for expected in [2, 3] {
		raise(Signal::SIGHUP).unwrap();
		tokio::time::timeout(Duration::from_secs(5), epochs.wait_for(|e| *e == expected))
			.await
			.expect("restart after SIGHUP")
			.unwrap();
	}
	assert!(orch.parent().await.is_some());

	raise(Signal::SIGUSR1).unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(orch.restart_epoch().await, 3);
	assert!(orch.is_running().await);

	raise(Signal::SIGTERM).unwrap();
	let received = tokio::time::timeout(Duration::from_secs(10), listeners.wait_shutdown())
		.await
		.expect("shutdown after SIGTERM");
	assert_eq!(received, Some(Signal::SIGTERM));
	assert!(!orch.is_running().await);
	assert!(orch.parent().await.is_none());

	let _ = std::fs::remove_dir_all(&dir);
}
