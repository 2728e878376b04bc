use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use super::{AuthError, Provider, ProviderLookup, RequestContext};
use crate::auth::credential::{CredentialRecord, KeyStatus};
use crate::storage::CacheHandle;

pub const DEFAULT_KEY_TEMPLATE: &str = "llmproxy:key:{api_key}";

/// Credentials stored as cache hashes under a templated key, e.g.
/// `llmproxy:key:{api_key}` with fields `user_id`, `name`, `status`,
/// `quota`, `used`, `expire_at`, `allowed_ips`, `created_at`, `updated_at`.
pub struct CacheProvider {
	name: String,
	conn: CacheHandle,
	key_template: String,
}

impl CacheProvider {
	pub fn new(name: String, conn: CacheHandle, key_template: String) -> CacheProvider {
		CacheProvider {
			name,
			conn,
			key_template,
		}
	}

	fn cache_key(&self, api_key: &str) -> String {
		self.key_template.replace("{api_key}", api_key)
	}
}

fn parse_epoch_ms(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
	fields
		.get(name)
		.and_then(|v| v.parse::<i64>().ok())
		.and_then(DateTime::from_timestamp_millis)
}

fn parse_ip_list(fields: &HashMap<String, String>, name: &str) -> Vec<String> {
	fields
		.get(name)
		.map(|v| {
			v.split(',')
				.map(|s| s.trim().to_string())
				.filter(|s| !s.is_empty())
				.collect()
		})
		.unwrap_or_default()
}

fn record_from_fields(api_key: &str, fields: HashMap<String, String>) -> CredentialRecord {
	let mut cred = CredentialRecord::new(api_key);
	cred.user_id = fields.get("user_id").cloned().unwrap_or_default();
	cred.name = fields.get("name").cloned().unwrap_or_default();
	cred.status = match fields.get("status").map(|s| s.as_str()) {
		Some("disabled") => KeyStatus::Disabled,
		Some("expired") => KeyStatus::Expired,
		_ => KeyStatus::Active,
	};
	cred.quota = fields
		.get("quota")
		.and_then(|v| v.parse().ok())
		.unwrap_or(0);
	cred.used = fields.get("used").and_then(|v| v.parse().ok()).unwrap_or(0);
	cred.allowed_ips = parse_ip_list(&fields, "allowed_ips");
	cred.denied_ips = parse_ip_list(&fields, "denied_ips");
	cred.expire_at = parse_epoch_ms(&fields, "expire_at");
	cred.reset_period = fields
		.get("reset_period_secs")
		.and_then(|v| v.parse::<u64>().ok())
		.map(Duration::from_secs);
	cred.last_reset = parse_epoch_ms(&fields, "last_reset");
	cred
}

#[async_trait]
impl Provider for CacheProvider {
	fn name(&self) -> &str {
		&self.name
	}

	async fn lookup(&self, ctx: &RequestContext) -> Result<ProviderLookup, AuthError> {
		let Some(api_key) = ctx.api_key.as_deref() else {
			return Ok(ProviderLookup::NotFound);
		};
		let mut conn = self.conn.clone();
		let fields: HashMap<String, String> = conn
			.hgetall(self.cache_key(api_key))
			.await
			.map_err(|e| AuthError::Unavailable(e.to_string()))?;
		if fields.is_empty() {
			return Ok(ProviderLookup::NotFound);
		}
		Ok(ProviderLookup::Found(record_from_fields(api_key, fields)))
	}

	async fn deduct(&self, key: &str, tokens: u64) -> Result<(), AuthError> {
		let mut conn = self.conn.clone();
		let _: i64 = conn
			.hincr(self.cache_key(key), "used", tokens as i64)
			.await
			.map_err(|e| AuthError::Unavailable(e.to_string()))?;
		Ok(())
	}

	async fn reset_usage(&self, key: &str) -> Result<(), AuthError> {
		let mut conn = self.conn.clone();
		let now_ms = Utc::now().timestamp_millis();
		let _: () = redis::pipe()
			.hset(self.cache_key(key), "used", 0)
			.ignore()
			.hset(self.cache_key(key), "last_reset", now_ms)
			.ignore()
			.query_async(&mut conn)
			.await
			.map_err(|e| AuthError::Unavailable(e.to_string()))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn record_parses_hash_fields() {
		let mut fields = HashMap::new();
		fields.insert("user_id".to_string(), "u42".to_string());
		fields.insert("status".to_string(), "active".to_string());
		fields.insert("quota".to_string(), "5000".to_string());
		fields.insert("used".to_string(), "120".to_string());
		fields.insert(
			"allowed_ips".to_string(),
			"10.0.0.0/8, 192.168.1.1".to_string(),
		);
		fields.insert("expire_at".to_string(), "4102444800000".to_string());

		let cred = record_from_fields("sk-x", fields);
		assert_eq!(cred.user_id, "u42");
		assert_eq!(cred.quota, 5000);
		assert_eq!(cred.used, 120);
		assert_eq!(cred.allowed_ips.len(), 2);
		assert!(cred.expire_at.is_some());
		assert_eq!(cred.status, KeyStatus::Active);
	}

	#[test]
	fn missing_fields_default() {
		let cred = record_from_fields("sk-x", HashMap::from([(
			"user_id".to_string(),
			"u1".to_string(),
		)]));
		assert_eq!(cred.quota, 0);
		assert!(cred.allowed_ips.is_empty());
		assert!(cred.expire_at.is_none());
	}
}
