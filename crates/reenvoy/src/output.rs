use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tokio::sync::Mutex;

const RING_BUFFER_SIZE: usize = 64 * 1024;

/// Where a child's stdout/stderr go.
#[derive(Debug, Clone, Default)]
pub enum Output {
	#[default]
	Inherit,
	Null,
	Capture(OutputCapture),
}

impl Output {
	pub(crate) fn stdio(&self) -> Stdio {
		match self {
			Output::Inherit => Stdio::inherit(),
			Output::Null => Stdio::null(),
			Output::Capture(_) => Stdio::piped(),
		}
	}
}

/// Shared sink for captured output. Cloning shares the same buffer, so every
/// generation of the proxy can write into one capture.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<u8>>>,
	log_file: Arc<Mutex<Option<File>>>,
	log_path: Option<PathBuf>,
	sender: broadcast::Sender<Vec<u8>>,
}

impl std::fmt::Debug for OutputCapture {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OutputCapture")
			.field("log_path", &self.log_path)
			.finish_non_exhaustive()
	}
}

impl OutputCapture {
	/// In-memory capture only.
	pub fn new() -> Self {
		Self::build(None, None)
	}

	/// Capture that also appends everything to `path`.
	pub fn with_log_file(path: &Path) -> Self {
		if let Some(parent) = path.parent() {
			let _ = fs::create_dir_all(parent);
		}
		let file = match OpenOptions::new().create(true).append(true).open(path) {
			Ok(f) => Some(f),
			Err(e) => {
				tracing::warn!("cannot open output log {}: {}", path.display(), e);
				None
			}
		};
		Self::build(file, Some(path.to_path_buf()))
	}

	fn build(file: Option<File>, log_path: Option<PathBuf>) -> Self {
		let (sender, _) = broadcast::channel(256);
		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE))),
			log_file: Arc::new(Mutex::new(file)),
			log_path,
			sender,
		}
	}

	pub fn log_path(&self) -> Option<&Path> {
		self.log_path.as_deref()
	}

	pub async fn write(&self, data: &[u8]) {
		{
			let mut ring = self.ring.lock().await;
			let len = ring.len();
			let overflow = (len + data.len()).saturating_sub(RING_BUFFER_SIZE);
			ring.drain(..overflow.min(len));
			let tail = &data[data.len().saturating_sub(RING_BUFFER_SIZE)..];
			ring.extend(tail);
		}

		if let Some(file) = self.log_file.lock().await.as_mut() {
			let _ = file.write_all(data);
		}

		let _ = self.sender.send(data.to_vec());
	}

	/// Most recent bytes, oldest first.
	pub async fn snapshot(&self) -> Vec<u8> {
		let ring = self.ring.lock().await;
		ring.iter().copied().collect()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
		self.sender.subscribe()
	}
}

impl Default for OutputCapture {
	fn default() -> Self {
		Self::new()
	}
}

pub(crate) async fn pipe_output<R: AsyncRead + Unpin>(mut reader: R, output: OutputCapture) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => output.write(&buf[..n]).await,
			Err(_) => break,
		}
	}
}
