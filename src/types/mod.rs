use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single upstream endpoint. Created by discovery (or static config) and
/// treated as immutable by everyone else; mutable feedback (health, in-flight
/// counts, latency) lives in the load balancer, keyed by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Backend {
	pub name: String,
	pub url: String,
	#[serde(default = "default_weight")]
	pub weight: u32,
	/// Model tags this backend serves. Empty means "any model".
	#[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
	pub models: BTreeSet<String>,
}

fn default_weight() -> u32 {
	1
}

impl Backend {
	pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
		Backend {
			name: name.into(),
			url: url.into(),
			weight: 1,
			models: Default::default(),
		}
	}

	pub fn with_weight(mut self, weight: u32) -> Self {
		self.weight = weight.max(1);
		self
	}

	/// Normalize: trim a trailing slash so `url + path` concatenation is safe.
	pub fn normalized_url(&self) -> &str {
		self.url.strip_suffix('/').unwrap_or(&self.url)
	}
}

/// The merged output of one discovery cycle: an immutable ordered slice of
/// backends. Published by atomic replacement; a request that begins under
/// snapshot N completes against snapshot N.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSnapshot {
	pub backends: Arc<[Arc<Backend>]>,
	pub version: u64,
}

impl BackendSnapshot {
	pub fn new(backends: Vec<Backend>, version: u64) -> Self {
		BackendSnapshot {
			backends: backends.into_iter().map(Arc::new).collect(),
			version,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.backends.is_empty()
	}

	pub fn len(&self) -> usize {
		self.backends.len()
	}

	pub fn by_url(&self, url: &str) -> Option<Arc<Backend>> {
		self
			.backends
			.iter()
			.find(|b| b.url == url || b.normalized_url() == url)
			.cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn url_normalization() {
		let b = Backend::new("a", "http://a:8000/");
		assert_eq!(b.normalized_url(), "http://a:8000");
		let b = Backend::new("a", "http://a:8000");
		assert_eq!(b.normalized_url(), "http://a:8000");
	}

	#[test]
	fn weight_defaults_to_one() {
		let b: Backend = serde_yaml::from_str("name: a\nurl: http://a\n").unwrap();
		assert_eq!(b.weight, 1);
	}
}
