use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{BucketStore, CONCURRENCY_TTL_SECS, TakeResult};
use crate::storage::CacheHandle;

/// Refill and take in one server-side script so concurrent proxy instances
/// cannot race the compare-and-set. Bucket state is a hash of
/// `tokens` + `last_update` (epoch millis).
const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local state = redis.call('HMGET', key, 'tokens', 'last_update')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  last = now_ms
end
local elapsed = math.max(0, now_ms - last) / 1000.0
tokens = math.min(capacity, tokens + elapsed * rate)
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end
redis.call('HSET', key, 'tokens', tostring(tokens), 'last_update', tostring(now_ms))
redis.call('PEXPIRE', key, ttl_ms)
return {allowed, tostring(math.floor(tokens))}
"#;

/// Bucket store backed by the shared cache, for multi-instance deployments.
pub struct SharedStore {
	conn: CacheHandle,
	prefix: String,
	script: redis::Script,
}

impl SharedStore {
	pub fn new(conn: CacheHandle, prefix: &str) -> SharedStore {
		SharedStore {
			conn,
			prefix: prefix.to_string(),
			script: redis::Script::new(TAKE_SCRIPT),
		}
	}

	fn bucket_key(&self, key: &str) -> String {
		format!("{}:{}", self.prefix, key)
	}

	fn concurrency_key(&self, key: &str) -> String {
		format!("{}:concurrent:{}", self.prefix, key)
	}

	fn now_ms() -> u128 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis()
	}
}

#[async_trait]
impl BucketStore for SharedStore {
	async fn try_take(
		&self,
		key: &str,
		capacity: u64,
		refill_per_sec: f64,
	) -> anyhow::Result<TakeResult> {
		let mut conn = self.conn.clone();
		// Idle buckets expire once they would be full again anyway.
		let ttl_ms = if refill_per_sec > 0.0 {
			((capacity as f64 / refill_per_sec) * 1000.0).max(60_000.0) as u64
		} else {
			86_400_000
		};
		let (allowed, remaining): (i64, String) = self
			.script
			.key(self.bucket_key(key))
			.arg(capacity)
			.arg(refill_per_sec)
			.arg(Self::now_ms() as u64)
			.arg(ttl_ms)
			.invoke_async(&mut conn)
			.await?;
		Ok(TakeResult {
			allowed: allowed == 1,
			remaining: remaining.parse().unwrap_or(0),
		})
	}

	async fn incr_concurrent(&self, key: &str) -> anyhow::Result<i64> {
		let mut conn = self.conn.clone();
		let ckey = self.concurrency_key(key);
		let count: i64 = conn.incr(&ckey, 1).await?;
		let _: () = conn.expire(&ckey, CONCURRENCY_TTL_SECS).await?;
		Ok(count)
	}

	async fn decr_concurrent(&self, key: &str) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		let ckey = self.concurrency_key(key);
		let count: i64 = conn.decr(&ckey, 1).await?;
		if count < 0 {
			// Counter drifted (expiry raced a completion): clamp back to zero.
			let _: () = conn.set(&ckey, 0).await?;
		}
		Ok(())
	}
}
