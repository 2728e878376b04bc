use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::serdes::serde_dur;
use crate::storage::StorageManager;
use crate::types::{Backend, BackendSnapshot};

mod consul;
mod etcd;
mod http;
mod kubernetes;
mod sql;

pub use consul::ConsulSource;
pub use etcd::EtcdSource;
pub use http::HttpSource;
pub use kubernetes::KubernetesSource;
pub use sql::SqlSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiscoveryConfig {
	#[serde(default = "default_interval", with = "serde_dur")]
	pub interval: Duration,
	#[serde(default)]
	pub mode: CombineMode,
	#[serde(default)]
	pub sources: Vec<SourceConfig>,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		DiscoveryConfig {
			interval: default_interval(),
			mode: Default::default(),
			sources: Default::default(),
		}
	}
}

fn default_interval() -> Duration {
	Duration::from_secs(30)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CombineMode {
	/// Union across sources, deduplicated by URL; first occurrence wins.
	#[default]
	Merge,
	/// The first source returning a non-empty list wins.
	First,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", deny_unknown_fields)]
pub enum SourceConfig {
	#[serde(rename_all = "camelCase")]
	Static {
		#[serde(default)]
		name: Option<String>,
		backends: Vec<Backend>,
	},
	#[serde(rename_all = "camelCase")]
	Http {
		#[serde(default)]
		name: Option<String>,
		url: String,
	},
	#[serde(rename_all = "camelCase")]
	Consul {
		#[serde(default)]
		name: Option<String>,
		address: String,
		service: String,
		#[serde(default)]
		datacenter: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	Kubernetes {
		#[serde(default)]
		name: Option<String>,
		#[serde(default = "kubernetes::default_api_server")]
		api_server: String,
		namespace: String,
		service: String,
		#[serde(default = "kubernetes::default_token_path")]
		token_path: String,
		#[serde(default)]
		insecure: bool,
	},
	#[serde(rename_all = "camelCase")]
	Etcd {
		#[serde(default)]
		name: Option<String>,
		endpoint: String,
		prefix: String,
	},
	#[serde(rename_all = "camelCase")]
	Sql {
		#[serde(default)]
		name: Option<String>,
		storage: String,
		table: String,
		#[serde(default)]
		columns: sql::ColumnMap,
	},
}

/// One named backend source. Each call yields a complete, finite list;
/// errors from one source never poison another.
#[async_trait]
pub trait Source: Send + Sync {
	fn name(&self) -> &str;
	async fn fetch(&self) -> anyhow::Result<Vec<Backend>>;
}

/// A fixed list from configuration.
pub struct StaticSource {
	name: String,
	backends: Vec<Backend>,
}

impl StaticSource {
	pub fn new(name: impl Into<String>, backends: Vec<Backend>) -> Self {
		StaticSource {
			name: name.into(),
			backends,
		}
	}
}

#[async_trait]
impl Source for StaticSource {
	fn name(&self) -> &str {
		&self.name
	}
	async fn fetch(&self) -> anyhow::Result<Vec<Backend>> {
		Ok(self.backends.clone())
	}
}

pub struct DiscoveryManager {
	sources: Vec<Box<dyn Source>>,
	mode: CombineMode,
	interval: Duration,
	version: AtomicU64,
	tx: watch::Sender<Arc<BackendSnapshot>>,
}

impl DiscoveryManager {
	pub fn new(
		cfg: &DiscoveryConfig,
		storage: &StorageManager,
		client: reqwest::Client,
	) -> anyhow::Result<DiscoveryManager> {
		let mut sources: Vec<Box<dyn Source>> = Vec::with_capacity(cfg.sources.len());
		for (i, sc) in cfg.sources.iter().enumerate() {
			sources.push(build_source(sc, i, storage, &client)?);
		}
		let (tx, _) = watch::channel(Arc::new(BackendSnapshot::default()));
		Ok(DiscoveryManager {
			sources,
			mode: cfg.mode,
			interval: cfg.interval,
			version: AtomicU64::new(0),
			tx,
		})
	}

	pub fn from_sources(
		sources: Vec<Box<dyn Source>>,
		mode: CombineMode,
		interval: Duration,
	) -> DiscoveryManager {
		let (tx, _) = watch::channel(Arc::new(BackendSnapshot::default()));
		DiscoveryManager {
			sources,
			mode,
			interval,
			version: AtomicU64::new(0),
			tx,
		}
	}

	/// Readers hold a receiver and `borrow()` the current snapshot;
	/// replacement is atomic and in-flight requests keep their `Arc`.
	pub fn watch(&self) -> watch::Receiver<Arc<BackendSnapshot>> {
		self.tx.subscribe()
	}

	/// Run one cycle: poll every source, combine, and publish if the merged
	/// set changed. A failing source contributes nothing this cycle; its
	/// previous contribution is deliberately discarded (stale data is a worse
	/// failure than temporary shrinkage).
	pub async fn poll_once(&self) {
		let mut merged: Vec<Backend> = Vec::new();
		let mut seen: HashSet<String> = HashSet::new();
		for source in &self.sources {
			let fetched = tokio::time::timeout(self.interval, source.fetch()).await;
			let list = match fetched {
				Ok(Ok(list)) => list,
				Ok(Err(e)) => {
					warn!(source = source.name(), "discovery source failed: {e}");
					continue;
				},
				Err(_) => {
					warn!(source = source.name(), "discovery source timed out");
					continue;
				},
			};
			debug!(source = source.name(), count = list.len(), "fetched backends");
			match self.mode {
				CombineMode::First => {
					if !list.is_empty() {
						merged = list;
						break;
					}
				},
				CombineMode::Merge => {
					for b in list {
						if seen.insert(b.normalized_url().to_string()) {
							merged.push(b);
						}
					}
				},
			}
		}

		let current = self.tx.borrow().clone();
		let changed = current.backends.len() != merged.len()
			|| current
				.backends
				.iter()
				.zip(merged.iter())
				.any(|(a, b)| a.as_ref() != b);
		if changed {
			let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
			info!(version, backends = merged.len(), "publishing backend snapshot");
			let _ = self.tx.send(Arc::new(BackendSnapshot::new(merged, version)));
		}
	}

	pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
		// Populate an initial snapshot before the first tick.
		self.poll_once().await;
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		ticker.tick().await;
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					debug!("discovery manager stopped");
					return;
				},
				_ = ticker.tick() => {
					self.poll_once().await;
				},
			}
		}
	}
}

fn build_source(
	sc: &SourceConfig,
	index: usize,
	storage: &StorageManager,
	client: &reqwest::Client,
) -> anyhow::Result<Box<dyn Source>> {
	let fallback_name = |name: &Option<String>, kind: &str| {
		name
			.clone()
			.unwrap_or_else(|| format!("{kind}-{index}"))
	};
	Ok(match sc {
		SourceConfig::Static { name, backends } => Box::new(StaticSource::new(
			fallback_name(name, "static"),
			backends.clone(),
		)),
		SourceConfig::Http { name, url } => Box::new(HttpSource::new(
			fallback_name(name, "http"),
			url.clone(),
			client.clone(),
		)),
		SourceConfig::Consul {
			name,
			address,
			service,
			datacenter,
		} => Box::new(ConsulSource::new(
			fallback_name(name, "consul"),
			address.clone(),
			service.clone(),
			datacenter.clone(),
			client.clone(),
		)),
		SourceConfig::Kubernetes {
			name,
			api_server,
			namespace,
			service,
			token_path,
			insecure,
		} => Box::new(KubernetesSource::new(
			fallback_name(name, "kubernetes"),
			api_server.clone(),
			namespace.clone(),
			service.clone(),
			token_path.clone(),
			*insecure,
		)?),
		SourceConfig::Etcd {
			name,
			endpoint,
			prefix,
		} => Box::new(EtcdSource::new(
			fallback_name(name, "etcd"),
			endpoint.clone(),
			prefix.clone(),
			client.clone(),
		)),
		SourceConfig::Sql {
			name,
			storage: storage_name,
			table,
			columns,
		} => {
			let pool = storage
				.sql(storage_name)
				.ok_or_else(|| anyhow::anyhow!("unresolved storage reference {storage_name:?}"))?;
			Box::new(SqlSource::new(
				fallback_name(name, "sql"),
				pool,
				table.clone(),
				columns.clone(),
			))
		},
	})
}

/// Shared by the wire-facing sources: the documented JSON entry shape.
#[derive(Debug, Deserialize)]
pub(crate) struct WireBackend {
	pub name: Option<String>,
	pub url: String,
	#[serde(default)]
	pub weight: Option<u32>,
	#[serde(default)]
	pub status: Option<String>,
}

pub(crate) fn wire_status_enabled(status: &Option<String>) -> bool {
	match status.as_deref() {
		None | Some("") => true,
		Some(s) => s.eq_ignore_ascii_case("enabled") || s.eq_ignore_ascii_case("active"),
	}
}

impl WireBackend {
	pub(crate) fn into_backend(self, fallback_name: &str, index: usize) -> Backend {
		let name = self
			.name
			.unwrap_or_else(|| format!("{fallback_name}-{index}"));
		let mut b = Backend::new(name, self.url);
		if let Some(w) = self.weight {
			b = b.with_weight(w);
		}
		b
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;

	struct FakeSource {
		name: String,
		results: Mutex<Vec<anyhow::Result<Vec<Backend>>>>,
	}

	impl FakeSource {
		fn new(name: &str, results: Vec<anyhow::Result<Vec<Backend>>>) -> Self {
			FakeSource {
				name: name.to_string(),
				results: Mutex::new(results),
			}
		}
	}

	#[async_trait]
	impl Source for FakeSource {
		fn name(&self) -> &str {
			&self.name
		}
		async fn fetch(&self) -> anyhow::Result<Vec<Backend>> {
			let mut results = self.results.lock().unwrap();
			if results.is_empty() {
				return Ok(vec![]);
			}
			results.remove(0)
		}
	}

	fn backends(names: &[&str]) -> Vec<Backend> {
		names
			.iter()
			.map(|n| Backend::new(*n, format!("http://{n}:8000")))
			.collect()
	}

	#[tokio::test]
	async fn merge_dedupes_by_url_preserving_order() {
		let a = FakeSource::new(
			"static",
			vec![Ok(backends(&["a", "b"])), Ok(backends(&["a", "b"]))],
		);
		let b = FakeSource::new(
			"http",
			vec![Ok(backends(&["b", "c"])), Err(anyhow::anyhow!("boom"))],
		);
		let sources: Vec<Box<dyn Source>> = vec![Box::new(a), Box::new(b)];
		let mgr =
			DiscoveryManager::from_sources(sources, CombineMode::Merge, Duration::from_secs(30));
		let watch = mgr.watch();

		mgr.poll_once().await;
		let snap = watch.borrow().clone();
		let names: Vec<&str> = snap.backends.iter().map(|b| b.name.as_str()).collect();
		assert_eq!(names, vec!["a", "b", "c"]);

		// Second cycle: the http source errors, so its contribution is gone.
		mgr.poll_once().await;
		let snap2 = watch.borrow().clone();
		let names: Vec<&str> = snap2.backends.iter().map(|b| b.name.as_str()).collect();
		assert_eq!(names, vec!["a", "b"]);
		assert!(snap2.version > snap.version);
	}

	#[tokio::test]
	async fn first_mode_takes_first_non_empty() {
		let empty = FakeSource::new("empty", vec![Ok(vec![])]);
		let primary = FakeSource::new("primary", vec![Ok(backends(&["x"]))]);
		let secondary = FakeSource::new("secondary", vec![Ok(backends(&["y"]))]);
		let sources: Vec<Box<dyn Source>> =
			vec![Box::new(empty), Box::new(primary), Box::new(secondary)];
		let mgr = DiscoveryManager::from_sources(sources, CombineMode::First, Duration::from_secs(30));
		let watch = mgr.watch();
		mgr.poll_once().await;
		let snap = watch.borrow().clone();
		let names: Vec<&str> = snap.backends.iter().map(|b| b.name.as_str()).collect();
		assert_eq!(names, vec!["x"]);
	}

	#[tokio::test]
	async fn unchanged_result_is_not_republished() {
		let a = FakeSource::new(
			"static",
			vec![Ok(backends(&["a"])), Ok(backends(&["a"]))],
		);
		let sources: Vec<Box<dyn Source>> = vec![Box::new(a)];
		let mgr =
			DiscoveryManager::from_sources(sources, CombineMode::Merge, Duration::from_secs(30));
		let watch = mgr.watch();
		mgr.poll_once().await;
		let v1 = watch.borrow().version;
		mgr.poll_once().await;
		assert_eq!(watch.borrow().version, v1);
	}

	#[test]
	fn wire_status_filtering() {
		assert!(wire_status_enabled(&None));
		assert!(wire_status_enabled(&Some("enabled".to_string())));
		assert!(wire_status_enabled(&Some("Active".to_string())));
		assert!(!wire_status_enabled(&Some("disabled".to_string())));
	}
}
