use std::collections::BTreeMap;

pub const RESTART_EPOCH_VAR: &str = "RESTART_EPOCH";

/// Ordered set of variables layered on top of the child environment.
///
/// Upstream collaborators (key/value or secret watchers) hand the orchestrator
/// one of these whenever their data changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
	vars: BTreeMap<String, String>,
}

impl Environment {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a variable, replacing any character outside `[A-Za-z0-9_]` in
	/// the key with `_`.
	pub fn insert(&mut self, key: &str, value: impl Into<String>) {
		self.vars.insert(sanitize_key(key), value.into());
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.vars.get(key).map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.vars.len()
	}

	pub fn is_empty(&self) -> bool {
		self.vars.is_empty()
	}

	/// Produces `key=value` entries. Unless `pristine`, the current process
	/// environment is the base and our variables override it.
	pub fn compose(&self, pristine: bool) -> Vec<String> {
		let mut merged: BTreeMap<String, String> = BTreeMap::new();
		if !pristine {
			merged.extend(std::env::vars_os().filter_map(|(key, value)| {
				Some((key.into_string().ok()?, value.into_string().ok()?))
			}));
		}
		for (key, value) in &self.vars {
			merged.insert(key.clone(), value.clone());
		}
		merged
			.into_iter()
			.map(|(key, value)| format!("{}={}", key, value))
			.collect()
	}
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Environment {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		let mut env = Environment::new();
		for (key, value) in iter {
			env.insert(key.as_ref(), value);
		}
		env
	}
}

pub fn sanitize_key(key: &str) -> String {
	key.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keys_are_sanitized() {
		assert_eq!(sanitize_key("service/db.password"), "service_db_password");
		assert_eq!(sanitize_key("PLAIN_KEY1"), "PLAIN_KEY1");
		assert_eq!(sanitize_key("dash-key"), "dash_key");
	}

	#[test]
	fn pristine_compose_only_has_overlay() {
		let env: Environment = [("b", "2"), ("a", "1")].into_iter().collect();
		assert_eq!(env.compose(true), vec!["a=1", "b=2"]);
	}

	#[test]
	fn overlay_wins_over_inherited() {
		let path = std::env::var("PATH").unwrap_or_default();
		let mut env = Environment::new();
		env.insert("PATH", "/opt/override");
		let composed = env.compose(false);
		assert!(composed.contains(&"PATH=/opt/override".to_string()));
		if !path.is_empty() && path != "/opt/override" {
			assert!(!composed.contains(&format!("PATH={}", path)));
		}
	}

	#[test]
	fn equal_maps_compare_equal() {
		let a: Environment = [("x", "1")].into_iter().collect();
		let b: Environment = [("x", "1")].into_iter().collect();
		let c: Environment = [("x", "2")].into_iter().collect();
		assert_eq!(a, b);
		assert_ne!(a, c);
		assert_eq!(a.get("x"), Some("1"));
		assert_eq!(a.len(), 1);
	}
}
