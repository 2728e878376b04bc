use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::storage::StorageManager;

mod local;
mod shared;

pub use local::LocalStore;
pub use shared::SharedStore;

pub const GLOBAL_KEY: &str = "global";
/// Concurrency entries expire so an orphaned count cannot wedge a key.
pub const CONCURRENCY_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitConfig {
	#[serde(default)]
	pub store: StoreKind,
	/// Cache storage name, required when `store: cache`.
	#[serde(default)]
	pub storage: Option<String>,
	#[serde(default = "default_prefix")]
	pub prefix: String,
	#[serde(default)]
	pub global: Option<BucketConfig>,
	#[serde(default)]
	pub per_key: Option<PerKeyConfig>,
}

fn default_prefix() -> String {
	"llmproxy:ratelimit".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreKind {
	#[default]
	Local,
	Cache,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BucketConfig {
	pub capacity: u64,
	pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PerKeyConfig {
	pub capacity: u64,
	pub refill_per_sec: f64,
	#[serde(default)]
	pub max_concurrent: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TakeResult {
	pub allowed: bool,
	pub remaining: u64,
}

/// Bucket state lives behind this trait so a single-process map and a shared
/// cache are interchangeable. Refill is lazy: each take computes the tokens
/// accrued since `last_update` before spending one.
#[async_trait]
pub trait BucketStore: Send + Sync {
	async fn try_take(&self, key: &str, capacity: u64, refill_per_sec: f64)
	-> anyhow::Result<TakeResult>;
	/// Returns the counter value after increment.
	async fn incr_concurrent(&self, key: &str) -> anyhow::Result<i64>;
	async fn decr_concurrent(&self, key: &str) -> anyhow::Result<()>;
}

/// The outcome of a granted admission: limit headers to attach, plus the
/// concurrency key to release when the request completes (either way).
#[derive(Debug, Default, Clone)]
pub struct Allowance {
	pub limit: Option<u64>,
	pub remaining: Option<u64>,
	pub concurrency_key: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
	#[error("rate limit exceeded")]
	Exceeded { limit: u64, remaining: u64 },
	#[error("concurrency limit exceeded")]
	TooManyConcurrent { limit: u64 },
	#[error("rate limit store unavailable: {0}")]
	Store(#[from] anyhow::Error),
}

pub struct RateLimiter {
	store: Arc<dyn BucketStore>,
	global: Option<BucketConfig>,
	per_key: Option<PerKeyConfig>,
}

impl RateLimiter {
	pub fn from_config(
		cfg: &RateLimitConfig,
		storage: &StorageManager,
	) -> anyhow::Result<RateLimiter> {
		let store: Arc<dyn BucketStore> = match cfg.store {
			StoreKind::Local => Arc::new(LocalStore::new()),
			StoreKind::Cache => {
				let name = cfg
					.storage
					.as_deref()
					.ok_or_else(|| anyhow::anyhow!("rate limit store is cache but no storage is named"))?;
				let conn = storage
					.cache(name)
					.ok_or_else(|| anyhow::anyhow!("unresolved storage reference {name:?}"))?;
				Arc::new(SharedStore::new(conn, &cfg.prefix))
			},
		};
		Ok(RateLimiter {
			store,
			global: cfg.global,
			per_key: cfg.per_key,
		})
	}

	pub fn local(global: Option<BucketConfig>, per_key: Option<PerKeyConfig>) -> RateLimiter {
		RateLimiter {
			store: Arc::new(LocalStore::new()),
			global,
			per_key,
		}
	}

	/// Admission control for one request: the global bucket first, then the
	/// per-key bucket and concurrency cap when a key was extractable.
	pub async fn check(&self, api_key: Option<&str>) -> Result<Allowance, RateLimitError> {
		let mut allowance = Allowance::default();

		if let Some(global) = &self.global {
			let res = self
				.store
				.try_take(GLOBAL_KEY, global.capacity, global.refill_per_sec)
				.await?;
			allowance.limit = Some(global.capacity);
			allowance.remaining = Some(res.remaining);
			if !res.allowed {
				return Err(RateLimitError::Exceeded {
					limit: global.capacity,
					remaining: res.remaining,
				});
			}
		}

		let (Some(per_key), Some(key)) = (&self.per_key, api_key) else {
			return Ok(allowance);
		};
		let res = self
			.store
			.try_take(key, per_key.capacity, per_key.refill_per_sec)
			.await?;
		allowance.limit = Some(per_key.capacity);
		allowance.remaining = Some(res.remaining);
		if !res.allowed {
			return Err(RateLimitError::Exceeded {
				limit: per_key.capacity,
				remaining: res.remaining,
			});
		}

		if let Some(cap) = per_key.max_concurrent {
			let count = self.store.incr_concurrent(key).await?;
			if count > cap as i64 {
				let _ = self.store.decr_concurrent(key).await;
				return Err(RateLimitError::TooManyConcurrent { limit: cap });
			}
			allowance.concurrency_key = Some(key.to_string());
		}
		Ok(allowance)
	}

	/// Release the concurrency slot taken at admission. Called on every
	/// completion path, including client cancellation.
	pub async fn release(&self, allowance: &Allowance) {
		if let Some(key) = &allowance.concurrency_key {
			if let Err(e) = self.store.decr_concurrent(key).await {
				tracing::warn!("failed to release concurrency slot: {e}");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limiter(global: u64, per_key: Option<PerKeyConfig>) -> RateLimiter {
		RateLimiter::local(
			Some(BucketConfig {
				capacity: global,
				refill_per_sec: 1.0,
			}),
			per_key,
		)
	}

	#[tokio::test]
	async fn global_bucket_drains_and_rejects() {
		let rl = limiter(5, None);
		for _ in 0..5 {
			rl.check(None).await.unwrap();
		}
		let err = rl.check(None).await.unwrap_err();
		match err {
			RateLimitError::Exceeded { limit, remaining } => {
				assert_eq!(limit, 5);
				assert_eq!(remaining, 0);
			},
			other => panic!("unexpected: {other:?}"),
		}
	}

	#[tokio::test]
	async fn per_key_buckets_are_independent() {
		let rl = RateLimiter::local(
			None,
			Some(PerKeyConfig {
				capacity: 2,
				refill_per_sec: 0.0,
				max_concurrent: None,
			}),
		);
		rl.check(Some("k1")).await.unwrap();
		rl.check(Some("k1")).await.unwrap();
		assert!(rl.check(Some("k1")).await.is_err());
		// A different key has its own bucket.
		rl.check(Some("k2")).await.unwrap();
		// No key at all only consults the (absent) global bucket.
		rl.check(None).await.unwrap();
	}

	#[tokio::test]
	async fn concurrency_cap_enforced_and_released() {
		let rl = RateLimiter::local(
			None,
			Some(PerKeyConfig {
				capacity: 100,
				refill_per_sec: 100.0,
				max_concurrent: Some(2),
			}),
		);
		let a = rl.check(Some("k")).await.unwrap();
		let _b = rl.check(Some("k")).await.unwrap();
		assert!(matches!(
			rl.check(Some("k")).await.unwrap_err(),
			RateLimitError::TooManyConcurrent { limit: 2 }
		));
		rl.release(&a).await;
		rl.check(Some("k")).await.unwrap();
	}

	#[tokio::test]
	async fn allowance_reports_remaining() {
		let rl = limiter(3, None);
		let a = rl.check(None).await.unwrap();
		assert_eq!(a.limit, Some(3));
		assert_eq!(a.remaining, Some(2));
	}
}
