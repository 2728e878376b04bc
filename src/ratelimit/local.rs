use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{BucketStore, CONCURRENCY_TTL_SECS, TakeResult};

struct Bucket {
	tokens: f64,
	last_update: Instant,
}

struct Concurrent {
	count: i64,
	touched: Instant,
}

/// In-process bucket store: a keyed map behind a mutex. Refill is computed
/// lazily on each access; only arithmetic happens under the lock. This store
/// is not distributed — multi-instance deployments use the cache store.
pub struct LocalStore {
	buckets: Mutex<HashMap<String, Bucket>>,
	concurrent: Mutex<HashMap<String, Concurrent>>,
}

impl LocalStore {
	pub fn new() -> LocalStore {
		LocalStore {
			buckets: Mutex::new(HashMap::new()),
			concurrent: Mutex::new(HashMap::new()),
		}
	}

	fn take_at(
		&self,
		key: &str,
		capacity: u64,
		refill_per_sec: f64,
		now: Instant,
	) -> TakeResult {
		let mut buckets = self.buckets.lock().expect("poisoned");
		let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
			tokens: capacity as f64,
			last_update: now,
		});
		let elapsed = now.saturating_duration_since(bucket.last_update);
		bucket.tokens =
			(bucket.tokens + elapsed.as_secs_f64() * refill_per_sec).min(capacity as f64);
		bucket.last_update = now;
		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			TakeResult {
				allowed: true,
				remaining: bucket.tokens.floor() as u64,
			}
		} else {
			TakeResult {
				allowed: false,
				remaining: 0,
			}
		}
	}
}

impl Default for LocalStore {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl BucketStore for LocalStore {
	async fn try_take(
		&self,
		key: &str,
		capacity: u64,
		refill_per_sec: f64,
	) -> anyhow::Result<TakeResult> {
		Ok(self.take_at(key, capacity, refill_per_sec, Instant::now()))
	}

	async fn incr_concurrent(&self, key: &str) -> anyhow::Result<i64> {
		let mut concurrent = self.concurrent.lock().expect("poisoned");
		let now = Instant::now();
		let ttl = Duration::from_secs(CONCURRENCY_TTL_SECS as u64);
		// Expire orphaned entries so a crashed request cannot pin a key.
		concurrent.retain(|_, c| now.saturating_duration_since(c.touched) < ttl);
		let entry = concurrent.entry(key.to_string()).or_insert(Concurrent {
			count: 0,
			touched: now,
		});
		entry.count += 1;
		entry.touched = now;
		Ok(entry.count)
	}

	async fn decr_concurrent(&self, key: &str) -> anyhow::Result<()> {
		let mut concurrent = self.concurrent.lock().expect("poisoned");
		if let Some(entry) = concurrent.get_mut(key) {
			entry.count = (entry.count - 1).max(0);
			entry.touched = Instant::now();
			if entry.count == 0 {
				concurrent.remove(key);
			}
		}
		Ok(())
	}
}
