use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row};

use super::Source;
use crate::types::Backend;

/// Column-name mapping for the backends table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ColumnMap {
	#[serde(default = "default_name")]
	pub name: String,
	#[serde(default = "default_url")]
	pub url: String,
	#[serde(default = "default_weight")]
	pub weight: String,
	#[serde(default = "default_status")]
	pub status: String,
}

fn default_name() -> String {
	"name".to_string()
}
fn default_url() -> String {
	"url".to_string()
}
fn default_weight() -> String {
	"weight".to_string()
}
fn default_status() -> String {
	"status".to_string()
}

impl Default for ColumnMap {
	fn default() -> Self {
		ColumnMap {
			name: default_name(),
			url: default_url(),
			weight: default_weight(),
			status: default_status(),
		}
	}
}

/// Reads backends from a relational table. Identifiers come from
/// configuration (they cannot be bound), so they are validated to a strict
/// character set at construction; status filtering happens client-side to
/// stay driver-agnostic.
pub struct SqlSource {
	name: String,
	pool: AnyPool,
	query: String,
	columns: ColumnMap,
}

fn valid_ident(s: &str) -> bool {
	!s.is_empty()
		&& s
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

impl SqlSource {
	pub fn new(name: String, pool: AnyPool, table: String, columns: ColumnMap) -> Self {
		let query = if [&table, &columns.name, &columns.url, &columns.weight, &columns.status]
			.iter()
			.all(|s| valid_ident(s))
		{
			format!(
				"SELECT {n}, {u}, {w}, {s} FROM {t}",
				n = columns.name,
				u = columns.url,
				w = columns.weight,
				s = columns.status,
				t = table,
			)
		} else {
			String::new()
		};
		SqlSource {
			name,
			pool,
			query,
			columns,
		}
	}
}

#[async_trait]
impl Source for SqlSource {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self) -> anyhow::Result<Vec<Backend>> {
		if self.query.is_empty() {
			anyhow::bail!("invalid table or column identifier in sql source {:?}", self.name);
		}
		let rows = sqlx::query(&self.query).fetch_all(&self.pool).await?;
		let mut out = Vec::new();
		for row in rows {
			let status: String = row
				.try_get::<String, _>(self.columns.status.as_str())
				.unwrap_or_default();
			if !(status.is_empty()
				|| status.eq_ignore_ascii_case("enabled")
				|| status.eq_ignore_ascii_case("active"))
			{
				continue;
			}
			let name: String = row.try_get(self.columns.name.as_str())?;
			let url: String = row.try_get(self.columns.url.as_str())?;
			let weight = row
				.try_get::<i64, _>(self.columns.weight.as_str())
				.or_else(|_| row.try_get::<i32, _>(self.columns.weight.as_str()).map(i64::from))
				.unwrap_or(1);
			out.push(Backend::new(name, url).with_weight(weight.max(1) as u32));
		}
		Ok(out)
	}
}
