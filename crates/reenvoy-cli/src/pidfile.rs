use std::path::{Path, PathBuf};

/// Holds the supervisor's pid in a file for as long as it lives.
pub struct PidFile {
	path: PathBuf,
}

impl PidFile {
	pub fn create(path: &Path) -> Result<Self, String> {
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)
					.map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
			}
		}
		std::fs::write(path, std::process::id().to_string())
			.map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
		Ok(Self {
			path: path.to_path_buf(),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for PidFile {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.path);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn written_then_removed() {
		let path = std::env::temp_dir()
			.join(format!("reenvoy-pid-{}", std::process::id()))
			.join("reenvoy.pid");
		{
			let pid = PidFile::create(&path).unwrap();
			let content = std::fs::read_to_string(pid.path()).unwrap();
			assert_eq!(content, std::process::id().to_string());
		}
		assert!(!path.exists());
		let _ = std::fs::remove_dir_all(path.parent().unwrap());
	}
}
