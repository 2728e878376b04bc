use async_trait::async_trait;
use serde::Deserialize;

use super::Source;
use crate::types::Backend;

/// Consul health API: only instances passing all checks are returned
/// (`?passing=true`). Weight can be carried in `Service.Meta.weight`.
pub struct ConsulSource {
	name: String,
	address: String,
	service: String,
	datacenter: Option<String>,
	client: reqwest::Client,
}

impl ConsulSource {
	pub fn new(
		name: String,
		address: String,
		service: String,
		datacenter: Option<String>,
		client: reqwest::Client,
	) -> Self {
		ConsulSource {
			name,
			address,
			service,
			datacenter,
			client,
		}
	}
}

#[derive(Deserialize)]
struct HealthEntry {
	#[serde(rename = "Node")]
	node: Node,
	#[serde(rename = "Service")]
	service: ServiceEntry,
}

#[derive(Deserialize)]
struct Node {
	#[serde(rename = "Address")]
	address: String,
}

#[derive(Deserialize)]
struct ServiceEntry {
	#[serde(rename = "ID")]
	id: String,
	#[serde(rename = "Address", default)]
	address: String,
	#[serde(rename = "Port")]
	port: u16,
	#[serde(rename = "Meta", default)]
	meta: std::collections::HashMap<String, String>,
}

#[async_trait]
impl Source for ConsulSource {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self) -> anyhow::Result<Vec<Backend>> {
		let base = self.address.strip_suffix('/').unwrap_or(&self.address);
		let mut req = self
			.client
			.get(format!("{base}/v1/health/service/{}", self.service))
			.query(&[("passing", "true")]);
		if let Some(dc) = &self.datacenter {
			req = req.query(&[("dc", dc.as_str())]);
		}
		let entries: Vec<HealthEntry> = req.send().await?.error_for_status()?.json().await?;
		Ok(
			entries
				.into_iter()
				.map(|e| {
					// Service-level address wins over the node address.
					let addr = if e.service.address.is_empty() {
						&e.node.address
					} else {
						&e.service.address
					};
					let mut b = Backend::new(e.service.id, format!("http://{addr}:{}", e.service.port));
					if let Some(w) = e.service.meta.get("weight").and_then(|w| w.parse().ok()) {
						b = b.with_weight(w);
					}
					b
				})
				.collect(),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_health_response() {
		let doc = r#"[
			{
				"Node": {"Address": "10.0.0.1"},
				"Service": {"ID": "llm-1", "Address": "", "Port": 8000, "Meta": {"weight": "3"}}
			},
			{
				"Node": {"Address": "10.0.0.2"},
				"Service": {"ID": "llm-2", "Address": "10.0.1.2", "Port": 8001}
			}
		]"#;
		let entries: Vec<HealthEntry> = serde_json::from_str(doc).unwrap();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].node.address, "10.0.0.1");
		assert_eq!(entries[1].service.address, "10.0.1.2");
		assert_eq!(entries[0].service.meta.get("weight").unwrap(), "3");
	}
}
