use std::time::Duration;

use crate::options::ProxyOptions;

/// Concrete command line for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
	pub program: String,
	pub args: Vec<String>,
}

impl std::fmt::Display for SpawnCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.program)?;
		for arg in &self.args {
			write!(f, " {}", arg)?;
		}
		Ok(())
	}
}

/// Builds the proxy invocation for `epoch`, either wrapped in a container
/// runtime or as a bare process.
pub fn build_command(opts: &ProxyOptions, epoch: u32) -> SpawnCommand {
	if opts.docker {
		container_command(opts, epoch)
	} else {
		bare_command(opts, epoch)
	}
}

fn container_command(opts: &ProxyOptions, epoch: u32) -> SpawnCommand {
	let container_dir = opts.container_config_dir.trim_end_matches('/');
	let mut args = vec![
		"run".to_string(),
		"--network".to_string(),
		"host".to_string(),
		"-v".to_string(),
		format!("{}:{}:ro", opts.config_path.display(), container_dir),
		opts.image.clone(),
		opts.binary.clone(),
	];
	args.extend(proxy_flags(
		opts,
		epoch,
		format!("{}/{}", container_dir, opts.config_file),
	));
	SpawnCommand {
		program: opts.container_runtime.clone(),
		args,
	}
}

fn bare_command(opts: &ProxyOptions, epoch: u32) -> SpawnCommand {
	let config = opts.config_path.join(&opts.config_file);
	SpawnCommand {
		program: opts.binary.clone(),
		args: proxy_flags(opts, epoch, config.display().to_string()),
	}
}

fn proxy_flags(opts: &ProxyOptions, epoch: u32, config_file: String) -> Vec<String> {
	let mut args = vec![
		"--mode".to_string(),
		"serve".to_string(),
		"--restart-epoch".to_string(),
		epoch.to_string(),
		"--drain-time-s".to_string(),
		seconds(opts.drain_time),
		"--parent-shutdown-time-s".to_string(),
		seconds(opts.parent_shutdown_time),
		"-c".to_string(),
		config_file,
	];
	args.extend(opts.extra_args.iter().cloned());
	args
}

// Whole seconds print without a fraction ("60"), partial ones keep it ("1.5").
fn seconds(d: Duration) -> String {
	format!("{}", d.as_secs_f64())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	fn opts(docker: bool) -> ProxyOptions {
		ProxyOptions {
			config_path: PathBuf::from("/srv/envoy"),
			docker,
			..ProxyOptions::default()
		}
	}

	#[test]
	fn bare_process_invocation() {
		let cmd = build_command(&opts(false), 3);
		assert_eq!(cmd.program, "envoy");
		assert_eq!(
			cmd.args,
			vec![
				"--mode",
				"serve",
				"--restart-epoch",
				"3",
				"--drain-time-s",
				"60",
				"--parent-shutdown-time-s",
				"70",
				"-c",
				"/srv/envoy/envoy.yaml",
			]
		);
	}

	#[test]
	fn container_invocation_mounts_config_read_only() {
		let cmd = build_command(&opts(true), 0);
		assert_eq!(cmd.program, "docker");
		assert_eq!(&cmd.args[..4], &["run", "--network", "host", "-v"]);
		assert_eq!(cmd.args[4], "/srv/envoy:/etc/envoy:ro");
		assert_eq!(cmd.args[5], crate::options::ENVOY_DOCKER_IMAGE);
		assert_eq!(cmd.args[6], "envoy");
		assert!(cmd.args.ends_with(&["-c".to_string(), "/etc/envoy/envoy.yaml".to_string()]));
		let epoch = cmd.args.iter().position(|a| a == "--restart-epoch").unwrap();
		assert_eq!(cmd.args[epoch + 1], "0");
	}

	#[test]
	fn fractional_drain_times() {
		let o = ProxyOptions {
			drain_time: Duration::from_millis(1500),
			parent_shutdown_time: Duration::from_millis(2250),
			..opts(false)
		};
		let cmd = build_command(&o, 1);
		let drain = cmd.args.iter().position(|a| a == "--drain-time-s").unwrap();
		assert_eq!(cmd.args[drain + 1], "1.5");
		let parent = cmd.args.iter().position(|a| a == "--parent-shutdown-time-s").unwrap();
		assert_eq!(cmd.args[parent + 1], "2.25");
	}

	#[test]
	fn extra_args_are_appended() {
		let o = ProxyOptions {
			extra_args: vec!["--log-level".into(), "debug".into()],
			..opts(false)
		};
		let cmd = build_command(&o, 0);
		assert!(cmd.args.ends_with(&["--log-level".to_string(), "debug".to_string()]));
	}

	#[test]
	fn display_joins_program_and_args() {
		let cmd = SpawnCommand {
			program: "envoy".into(),
			args: vec!["--mode".into(), "serve".into()],
		};
		assert_eq!(cmd.to_string(), "envoy --mode serve");
	}
}
