use std::time::Duration;

use async_trait::async_trait;

use super::{Sink, UsageRecord};

/// POSTs the JSON-encoded record; any 2xx marks success.
pub struct WebhookSink {
	name: String,
	url: String,
	client: reqwest::Client,
}

impl WebhookSink {
	pub fn new(name: String, url: String, timeout: Duration) -> anyhow::Result<WebhookSink> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(WebhookSink { name, url, client })
	}
}

#[async_trait]
impl Sink for WebhookSink {
	fn name(&self) -> &str {
		&self.name
	}

	async fn deliver(&self, record: &UsageRecord) -> anyhow::Result<()> {
		let resp = self.client.post(&self.url).json(record).send().await?;
		if !resp.status().is_success() {
			anyhow::bail!("usage webhook returned {}", resp.status());
		}
		Ok(())
	}
}
