use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::mtrcs::Metrics;
use crate::serdes::serde_dur;
use crate::storage::StorageManager;

mod sql;
mod webhook;

pub use sql::SqlSink;
pub use webhook::WebhookSink;

/// One completed (or failed) request, normalized for accounting. The API key
/// is already masked when the record is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UsageRecord {
	pub request_id: String,
	pub timestamp: DateTime<Utc>,
	pub api_key: String,
	pub user_id: String,
	pub method: String,
	pub path: String,
	pub backend_url: String,
	pub status_code: u16,
	pub latency_ms: u64,
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
	/// The original request body, passed through opaque.
	pub request_body: serde_json::Value,
	pub is_stream: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UsageConfig {
	#[serde(default = "default_queue_size")]
	pub queue_size: usize,
	#[serde(default)]
	pub sinks: Vec<SinkConfig>,
}

fn default_queue_size() -> usize {
	1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", deny_unknown_fields)]
pub enum SinkConfig {
	#[serde(rename_all = "camelCase")]
	Webhook {
		#[serde(default)]
		name: Option<String>,
		url: String,
		#[serde(default = "default_webhook_timeout", with = "serde_dur")]
		timeout: Duration,
		#[serde(default = "default_retries")]
		retries: u32,
	},
	#[serde(rename_all = "camelCase")]
	Sql {
		#[serde(default)]
		name: Option<String>,
		storage: String,
		#[serde(default = "default_table")]
		table: String,
		#[serde(default = "default_retries")]
		retries: u32,
	},
}

fn default_webhook_timeout() -> Duration {
	Duration::from_secs(1)
}
fn default_retries() -> u32 {
	2
}
fn default_table() -> String {
	"usage_records".to_string()
}

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[async_trait]
pub trait Sink: Send + Sync {
	fn name(&self) -> &str;
	async fn deliver(&self, record: &UsageRecord) -> anyhow::Result<()>;
}

struct SinkWorker {
	sink: Box<dyn Sink>,
	retries: u32,
	rx: mpsc::Receiver<Arc<UsageRecord>>,
	metrics: Arc<Metrics>,
}

impl SinkWorker {
	async fn run(mut self) {
		while let Some(record) = self.rx.recv().await {
			let mut delivered = false;
			for attempt in 0..=self.retries {
				match self.sink.deliver(&record).await {
					Ok(()) => {
						delivered = true;
						break;
					},
					Err(e) => {
						debug!(
							sink = self.sink.name(),
							attempt,
							"usage delivery failed: {e}"
						);
						if attempt < self.retries {
							tokio::time::sleep(RETRY_BACKOFF).await;
						}
					},
				}
			}
			if !delivered {
				self.metrics.usage_dropped.inc();
				warn!(
					sink = self.sink.name(),
					request_id = %record.request_id,
					"usage record dropped after retries"
				);
			}
		}
	}
}

/// Fan-out delivery with one bounded queue and one worker per sink, so a
/// slow sink cannot starve another and can never block the response path.
pub struct UsageReporter {
	senders: Vec<(String, mpsc::Sender<Arc<UsageRecord>>)>,
	metrics: Arc<Metrics>,
}

impl UsageReporter {
	pub fn new(
		cfg: &UsageConfig,
		storage: &StorageManager,
		metrics: Arc<Metrics>,
	) -> anyhow::Result<UsageReporter> {
		let mut senders = Vec::new();
		for (i, sc) in cfg.sinks.iter().enumerate() {
			let (sink, retries): (Box<dyn Sink>, u32) = match sc {
				SinkConfig::Webhook {
					name,
					url,
					timeout,
					retries,
				} => {
					let name = name.clone().unwrap_or_else(|| format!("webhook-{i}"));
					(
						Box::new(WebhookSink::new(name, url.clone(), *timeout)?),
						*retries,
					)
				},
				SinkConfig::Sql {
					name,
					storage: storage_name,
					table,
					retries,
				} => {
					let name = name.clone().unwrap_or_else(|| format!("sql-{i}"));
					let pool = storage
						.sql(storage_name)
						.ok_or_else(|| anyhow::anyhow!("unresolved storage reference {storage_name:?}"))?;
					let dialect = storage
						.sql_dialect(storage_name)
						.unwrap_or(crate::storage::SqlDialect::Sqlite);
					(
						Box::new(SqlSink::new(name, pool, table.clone(), dialect)),
						*retries,
					)
				},
			};
			let (tx, rx) = mpsc::channel(cfg.queue_size.max(1));
			let worker = SinkWorker {
				retries,
				rx,
				metrics: metrics.clone(),
				sink,
			};
			senders.push((worker.sink.name().to_string(), tx));
			tokio::spawn(worker.run());
		}
		Ok(UsageReporter { senders, metrics })
	}

	/// Non-blocking: saturation drops the record for that sink with a
	/// counter increment rather than applying backpressure to proxying.
	pub fn enqueue(&self, record: UsageRecord) {
		self.metrics.usage_records.inc();
		if self.senders.is_empty() {
			return;
		}
		let record = Arc::new(record);
		for (name, tx) in &self.senders {
			if tx.try_send(record.clone()).is_err() {
				self.metrics.usage_dropped.inc();
				warn!(sink = %name, "usage queue saturated, dropping record");
			}
		}
	}
}

#[cfg(test)]
pub(crate) fn test_record() -> UsageRecord {
	UsageRecord {
		request_id: "req-1".to_string(),
		timestamp: Utc::now(),
		api_key: "sk-abc****wxyz".to_string(),
		user_id: "u1".to_string(),
		method: "POST".to_string(),
		path: "/v1/chat/completions".to_string(),
		backend_url: "http://b1:8000".to_string(),
		status_code: 200,
		latency_ms: 42,
		prompt_tokens: 10,
		completion_tokens: 20,
		total_tokens: 30,
		request_body: serde_json::json!({"model": "x"}),
		is_stream: false,
	}
}
