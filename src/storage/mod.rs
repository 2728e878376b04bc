use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::info;

/// A declared connection, referenced elsewhere by its logical name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageConfig {
	pub name: String,
	pub kind: StorageKind,
	pub url: String,
	#[serde(default = "default_max_connections")]
	pub max_connections: u32,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
}

fn default_max_connections() -> u32 {
	10
}

fn default_enabled() -> bool {
	true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageKind {
	Sql,
	Cache,
}

pub type SqlHandle = AnyPool;
/// Clone-able and reconnecting; a cache blip degrades requests instead of
/// wedging every holder of the handle.
pub type CacheHandle = redis::aio::ConnectionManager;

/// The Any driver does not translate placeholder syntax, so SQL built at
/// runtime needs to know which family it is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
	Postgres,
	MySql,
	Sqlite,
}

impl SqlDialect {
	pub fn from_url(url: &str) -> SqlDialect {
		if url.starts_with("postgres") {
			SqlDialect::Postgres
		} else if url.starts_with("mysql") || url.starts_with("mariadb") {
			SqlDialect::MySql
		} else {
			SqlDialect::Sqlite
		}
	}

	/// 1-based positional placeholder.
	pub fn placeholder(&self, i: usize) -> String {
		match self {
			SqlDialect::Postgres => format!("${i}"),
			_ => "?".to_string(),
		}
	}
}

/// Owns every declared database and cache connection. Opened once at
/// startup; a declared-enabled connection that cannot be opened is fatal.
/// After `close`, lookups return `None` and callers treat the collaborator
/// as unavailable.
pub struct StorageManager {
	sql: Mutex<HashMap<String, AnyPool>>,
	dialects: Mutex<HashMap<String, SqlDialect>>,
	cache: Mutex<HashMap<String, CacheHandle>>,
	closed: AtomicBool,
}

impl StorageManager {
	pub async fn connect(configs: &[StorageConfig]) -> anyhow::Result<StorageManager> {
		sqlx::any::install_default_drivers();
		let mut sql = HashMap::new();
		let mut dialects = HashMap::new();
		let mut cache = HashMap::new();
		for cfg in configs.iter().filter(|c| c.enabled) {
			match cfg.kind {
				StorageKind::Sql => {
					let pool = AnyPoolOptions::new()
						.max_connections(cfg.max_connections)
						.connect(&cfg.url)
						.await
						.with_context(|| format!("opening sql storage {:?}", cfg.name))?;
					info!(name = %cfg.name, "opened sql storage");
					dialects.insert(cfg.name.clone(), SqlDialect::from_url(&cfg.url));
					sql.insert(cfg.name.clone(), pool);
				},
				StorageKind::Cache => {
					let client = redis::Client::open(cfg.url.as_str())
						.with_context(|| format!("parsing cache url for {:?}", cfg.name))?;
					let conn = client
						.get_connection_manager()
						.await
						.with_context(|| format!("opening cache storage {:?}", cfg.name))?;
					info!(name = %cfg.name, "opened cache storage");
					cache.insert(cfg.name.clone(), conn);
				},
			}
		}
		Ok(StorageManager {
			sql: Mutex::new(sql),
			dialects: Mutex::new(dialects),
			cache: Mutex::new(cache),
			closed: AtomicBool::new(false),
		})
	}

	pub fn empty() -> StorageManager {
		StorageManager {
			sql: Mutex::new(HashMap::new()),
			dialects: Mutex::new(HashMap::new()),
			cache: Mutex::new(HashMap::new()),
			closed: AtomicBool::new(false),
		}
	}

	pub fn sql_dialect(&self, name: &str) -> Option<SqlDialect> {
		self.dialects.lock().expect("poisoned").get(name).copied()
	}

	pub fn sql(&self, name: &str) -> Option<SqlHandle> {
		if self.closed.load(Ordering::Acquire) {
			return None;
		}
		self.sql.lock().expect("poisoned").get(name).cloned()
	}

	pub fn cache(&self, name: &str) -> Option<CacheHandle> {
		if self.closed.load(Ordering::Acquire) {
			return None;
		}
		self.cache.lock().expect("poisoned").get(name).cloned()
	}

	/// Idempotent. Pools are closed; cache connections drop with their last
	/// clone.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		let pools: Vec<AnyPool> = {
			let mut sql = self.sql.lock().expect("poisoned");
			sql.drain().map(|(_, p)| p).collect()
		};
		for pool in pools {
			pool.close().await;
		}
		self.cache.lock().expect("poisoned").clear();
	}
}
