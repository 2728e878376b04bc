use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};

use super::{AuthError, Provider, ProviderLookup, RequestContext};
use crate::auth::credential::{CredentialRecord, KeyStatus};
use crate::storage::SqlDialect;

pub const DEFAULT_TABLE: &str = "api_keys";

/// Credentials in a relational table. Timestamps are stored as epoch millis
/// so the Any driver can read them on every supported database.
pub struct SqlProvider {
	name: String,
	pool: AnyPool,
	select: String,
	deduct: String,
	reset: String,
}

impl SqlProvider {
	pub fn new(name: String, pool: AnyPool, table: &str, dialect: SqlDialect) -> SqlProvider {
		let select = format!(
			"SELECT api_key, user_id, name, status, quota, used, allowed_ips, denied_ips, \
			 expire_at, reset_period_secs, last_reset FROM {table} WHERE api_key = {p1}",
			p1 = dialect.placeholder(1),
		);
		let deduct = format!(
			"UPDATE {table} SET used = used + {p1} WHERE api_key = {p2}",
			p1 = dialect.placeholder(1),
			p2 = dialect.placeholder(2),
		);
		let reset = format!(
			"UPDATE {table} SET used = 0, last_reset = {p1} WHERE api_key = {p2}",
			p1 = dialect.placeholder(1),
			p2 = dialect.placeholder(2),
		);
		SqlProvider {
			name,
			pool,
			select,
			deduct,
			reset,
		}
	}
}

fn split_ips(raw: Option<String>) -> Vec<String> {
	raw
		.map(|v| {
			v.split(',')
				.map(|s| s.trim().to_string())
				.filter(|s| !s.is_empty())
				.collect()
		})
		.unwrap_or_default()
}

#[async_trait]
impl Provider for SqlProvider {
	fn name(&self) -> &str {
		&self.name
	}

	async fn lookup(&self, ctx: &RequestContext) -> Result<ProviderLookup, AuthError> {
		let Some(api_key) = ctx.api_key.as_deref() else {
			return Ok(ProviderLookup::NotFound);
		};
		let row = sqlx::query(&self.select)
			.bind(api_key)
			.fetch_optional(&self.pool)
			.await
			.map_err(|e| AuthError::Unavailable(e.to_string()))?;
		let Some(row) = row else {
			return Ok(ProviderLookup::NotFound);
		};

		let mut cred = CredentialRecord::new(api_key);
		cred.user_id = row.try_get::<String, _>("user_id").unwrap_or_default();
		cred.name = row.try_get::<String, _>("name").unwrap_or_default();
		cred.status = match row
			.try_get::<String, _>("status")
			.unwrap_or_default()
			.as_str()
		{
			"disabled" => KeyStatus::Disabled,
			"expired" => KeyStatus::Expired,
			_ => KeyStatus::Active,
		};
		cred.quota = row.try_get::<i64, _>("quota").unwrap_or(0).max(0) as u64;
		cred.used = row.try_get::<i64, _>("used").unwrap_or(0).max(0) as u64;
		cred.allowed_ips = split_ips(row.try_get::<Option<String>, _>("allowed_ips").unwrap_or(None));
		cred.denied_ips = split_ips(row.try_get::<Option<String>, _>("denied_ips").unwrap_or(None));
		cred.expire_at = row
			.try_get::<Option<i64>, _>("expire_at")
			.unwrap_or(None)
			.and_then(DateTime::from_timestamp_millis);
		cred.reset_period = row
			.try_get::<Option<i64>, _>("reset_period_secs")
			.unwrap_or(None)
			.filter(|s| *s > 0)
			.map(|s| Duration::from_secs(s as u64));
		cred.last_reset = row
			.try_get::<Option<i64>, _>("last_reset")
			.unwrap_or(None)
			.and_then(DateTime::from_timestamp_millis);
		Ok(ProviderLookup::Found(cred))
	}

	async fn deduct(&self, key: &str, tokens: u64) -> Result<(), AuthError> {
		sqlx::query(&self.deduct)
			.bind(tokens as i64)
			.bind(key)
			.execute(&self.pool)
			.await
			.map_err(|e| AuthError::Unavailable(e.to_string()))?;
		Ok(())
	}

	async fn reset_usage(&self, key: &str) -> Result<(), AuthError> {
		sqlx::query(&self.reset)
			.bind(Utc::now().timestamp_millis())
			.bind(key)
			.execute(&self.pool)
			.await
			.map_err(|e| AuthError::Unavailable(e.to_string()))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn seeded_pool() -> AnyPool {
		sqlx::any::install_default_drivers();
		let pool = sqlx::any::AnyPoolOptions::new()
			.max_connections(1)
			.connect("sqlite::memory:")
			.await
			.unwrap();
		sqlx::query(
			"CREATE TABLE api_keys (api_key TEXT PRIMARY KEY, user_id TEXT, name TEXT, \
			 status TEXT, quota BIGINT, used BIGINT, allowed_ips TEXT, denied_ips TEXT, \
			 expire_at BIGINT, reset_period_secs BIGINT, last_reset BIGINT)",
		)
		.execute(&pool)
		.await
		.unwrap();
		sqlx::query(
			"INSERT INTO api_keys VALUES ('sk-db', 'u7', 'db key', 'active', 1000, 10, \
			 '10.0.0.0/8', NULL, NULL, NULL, NULL)",
		)
		.execute(&pool)
		.await
		.unwrap();
		pool
	}

	fn ctx(key: &str) -> RequestContext {
		RequestContext {
			api_key: Some(key.to_string()),
			client_ip: "10.0.0.1".parse().unwrap(),
			method: "POST".to_string(),
			path: "/v1/completions".to_string(),
			body: serde_json::Value::Null,
		}
	}

	#[tokio::test]
	async fn lookup_and_writeback() {
		let pool = seeded_pool().await;
		let p = SqlProvider::new(
			"sql".to_string(),
			pool.clone(),
			DEFAULT_TABLE,
			SqlDialect::Sqlite,
		);

		let ProviderLookup::Found(cred) = p.lookup(&ctx("sk-db")).await.unwrap() else {
			panic!("expected credential");
		};
		assert_eq!(cred.user_id, "u7");
		assert_eq!(cred.quota, 1000);
		assert_eq!(cred.allowed_ips, vec!["10.0.0.0/8"]);

		p.deduct("sk-db", 90).await.unwrap();
		let ProviderLookup::Found(cred) = p.lookup(&ctx("sk-db")).await.unwrap() else {
			panic!("expected credential");
		};
		assert_eq!(cred.used, 100);

		p.reset_usage("sk-db").await.unwrap();
		let ProviderLookup::Found(cred) = p.lookup(&ctx("sk-db")).await.unwrap() else {
			panic!("expected credential");
		};
		assert_eq!(cred.used, 0);
		assert!(cred.last_reset.is_some());

		assert!(matches!(
			p.lookup(&ctx("sk-missing")).await.unwrap(),
			ProviderLookup::NotFound
		));
	}
}
