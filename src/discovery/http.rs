use async_trait::async_trait;
use serde::Deserialize;

use super::{Source, WireBackend, wire_status_enabled};
use crate::types::Backend;

/// HTTP GET returning either `{"backends": [...]}`, `{"services": [...]}`
/// or a bare array of backend entries.
pub struct HttpSource {
	name: String,
	url: String,
	client: reqwest::Client,
}

impl HttpSource {
	pub fn new(name: String, url: String, client: reqwest::Client) -> Self {
		HttpSource { name, url, client }
	}
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDocument {
	Object {
		#[serde(default)]
		backends: Option<Vec<WireBackend>>,
		#[serde(default)]
		services: Option<Vec<WireBackend>>,
	},
	Array(Vec<WireBackend>),
}

#[async_trait]
impl Source for HttpSource {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self) -> anyhow::Result<Vec<Backend>> {
		let resp = self
			.client
			.get(&self.url)
			.send()
			.await?
			.error_for_status()?;
		let doc: WireDocument = resp.json().await?;
		let entries = match doc {
			WireDocument::Object { backends, services } => backends.or(services).unwrap_or_default(),
			WireDocument::Array(entries) => entries,
		};
		Ok(
			entries
				.into_iter()
				.filter(|e| wire_status_enabled(&e.status))
				.enumerate()
				.map(|(i, e)| e.into_backend(&self.name, i))
				.collect(),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(doc: &str) -> Vec<WireBackend> {
		match serde_json::from_str::<WireDocument>(doc).unwrap() {
			WireDocument::Object { backends, services } => backends.or(services).unwrap_or_default(),
			WireDocument::Array(entries) => entries,
		}
	}

	#[test]
	fn accepts_all_documented_shapes() {
		let entries = parse(r#"{"backends": [{"name": "a", "url": "http://a", "weight": 2}]}"#);
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].weight, Some(2));

		let entries = parse(r#"{"services": [{"url": "http://b"}]}"#);
		assert_eq!(entries.len(), 1);

		let entries = parse(r#"[{"url": "http://c", "status": "disabled"}]"#);
		assert_eq!(entries.len(), 1);
		assert!(!wire_status_enabled(&entries[0].status));
	}
}
