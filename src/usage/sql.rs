use async_trait::async_trait;
use sqlx::AnyPool;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{Sink, UsageRecord};
use crate::storage::SqlDialect;

/// INSERTs each record into a configured table, creating it lazily on first
/// delivery. DDL differs per driver; the INSERT uses ordered parameters.
pub struct SqlSink {
	name: String,
	pool: AnyPool,
	table: String,
	dialect: SqlDialect,
	insert: String,
	ready: OnceCell<()>,
}

impl SqlSink {
	pub fn new(name: String, pool: AnyPool, table: String, dialect: SqlDialect) -> SqlSink {
		// 14 ordered parameters; request_body (the 13th) is cast for
		// Postgres, whose jsonb column will not take bare text.
		let params: Vec<String> = (1..=14)
			.map(|i| {
				if i == 13 && dialect == SqlDialect::Postgres {
					format!("{}::jsonb", dialect.placeholder(i))
				} else {
					dialect.placeholder(i)
				}
			})
			.collect();
		let insert = format!(
			"INSERT INTO {table} (request_id, timestamp, api_key, user_id, method, path, \
			 backend_url, status_code, latency_ms, prompt_tokens, completion_tokens, \
			 total_tokens, request_body, is_stream) VALUES ({})",
			params.join(", "),
		);
		SqlSink {
			name,
			pool,
			table,
			dialect,
			insert,
			ready: OnceCell::new(),
		}
	}

	fn ddl(&self) -> Vec<String> {
		let t = &self.table;
		let create = match self.dialect {
			SqlDialect::Postgres => format!(
				"CREATE TABLE IF NOT EXISTS {t} (id BIGSERIAL PRIMARY KEY, request_id TEXT, \
				 timestamp BIGINT, api_key TEXT, user_id TEXT, method TEXT, path TEXT, \
				 backend_url TEXT, status_code BIGINT, latency_ms BIGINT, prompt_tokens BIGINT, \
				 completion_tokens BIGINT, total_tokens BIGINT, request_body JSONB, is_stream BOOLEAN)"
			),
			SqlDialect::MySql => format!(
				"CREATE TABLE IF NOT EXISTS {t} (id BIGINT AUTO_INCREMENT PRIMARY KEY, \
				 request_id VARCHAR(64), timestamp BIGINT, api_key VARCHAR(64), user_id VARCHAR(64), \
				 method VARCHAR(16), path VARCHAR(255), backend_url VARCHAR(255), status_code BIGINT, \
				 latency_ms BIGINT, prompt_tokens BIGINT, completion_tokens BIGINT, \
				 total_tokens BIGINT, request_body JSON, is_stream BOOLEAN)"
			),
			SqlDialect::Sqlite => format!(
				"CREATE TABLE IF NOT EXISTS {t} (id INTEGER PRIMARY KEY AUTOINCREMENT, \
				 request_id TEXT, timestamp BIGINT, api_key TEXT, user_id TEXT, method TEXT, \
				 path TEXT, backend_url TEXT, status_code BIGINT, latency_ms BIGINT, \
				 prompt_tokens BIGINT, completion_tokens BIGINT, total_tokens BIGINT, \
				 request_body TEXT, is_stream BOOLEAN)"
			),
		};
		let mut ddl = vec![create];
		for col in ["api_key", "user_id", "timestamp"] {
			ddl.push(format!(
				"CREATE INDEX IF NOT EXISTS idx_{t}_{col} ON {t} ({col})"
			));
		}
		ddl
	}

	async fn ensure_table(&self) -> anyhow::Result<()> {
		self
			.ready
			.get_or_try_init(|| async {
				for (i, stmt) in self.ddl().iter().enumerate() {
					if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
						// Index DDL is best-effort (MySQL has no IF NOT EXISTS
						// for indexes); the table itself must exist.
						if i == 0 {
							return Err(anyhow::anyhow!("creating usage table: {e}"));
						}
						debug!(sink = %self.name, "index creation skipped: {e}");
					}
				}
				Ok(())
			})
			.await?;
		Ok(())
	}
}

#[async_trait]
impl Sink for SqlSink {
	fn name(&self) -> &str {
		&self.name
	}

	async fn deliver(&self, record: &UsageRecord) -> anyhow::Result<()> {
		self.ensure_table().await?;
		sqlx::query(&self.insert)
			.bind(&record.request_id)
			.bind(record.timestamp.timestamp_millis())
			.bind(&record.api_key)
			.bind(&record.user_id)
			.bind(&record.method)
			.bind(&record.path)
			.bind(&record.backend_url)
			.bind(record.status_code as i64)
			.bind(record.latency_ms as i64)
			.bind(record.prompt_tokens as i64)
			.bind(record.completion_tokens as i64)
			.bind(record.total_tokens as i64)
			.bind(record.request_body.to_string())
			.bind(record.is_stream)
			.execute(&self.pool)
			.await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use sqlx::Row;

	use super::*;
	use crate::usage::test_record;

	#[tokio::test]
	async fn creates_table_and_inserts() {
		sqlx::any::install_default_drivers();
		let pool = sqlx::any::AnyPoolOptions::new()
			.max_connections(1)
			.connect("sqlite::memory:")
			.await
			.unwrap();
		let sink = SqlSink::new(
			"sql".to_string(),
			pool.clone(),
			"usage_records".to_string(),
			SqlDialect::Sqlite,
		);

		sink.deliver(&test_record()).await.unwrap();
		sink.deliver(&test_record()).await.unwrap();

		let row = sqlx::query("SELECT COUNT(*) AS n FROM usage_records")
			.fetch_one(&pool)
			.await
			.unwrap();
		assert_eq!(row.try_get::<i64, _>("n").unwrap(), 2);

		let row = sqlx::query("SELECT api_key, total_tokens, is_stream FROM usage_records LIMIT 1")
			.fetch_one(&pool)
			.await
			.unwrap();
		// Keys land masked; the sink never sees the raw key.
		assert_eq!(row.try_get::<String, _>("api_key").unwrap(), "sk-abc****wxyz");
		assert_eq!(row.try_get::<i64, _>("total_tokens").unwrap(), 30);
		assert!(!row.try_get::<bool, _>("is_stream").unwrap());
	}
}
