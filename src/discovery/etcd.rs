use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;

use super::{Source, WireBackend, wire_status_enabled};
use crate::types::Backend;

/// etcd v3 gateway range read. Keys in the gateway API are base64-encoded;
/// each value under the prefix is a JSON backend entry.
pub struct EtcdSource {
	name: String,
	endpoint: String,
	prefix: String,
	client: reqwest::Client,
}

impl EtcdSource {
	pub fn new(name: String, endpoint: String, prefix: String, client: reqwest::Client) -> Self {
		EtcdSource {
			name,
			endpoint,
			prefix,
			client,
		}
	}

	/// The range end for a prefix scan: the prefix with its last byte
	/// incremented (etcd's documented prefix convention).
	fn range_end(prefix: &[u8]) -> Vec<u8> {
		let mut end = prefix.to_vec();
		for i in (0..end.len()).rev() {
			if end[i] < 0xff {
				end[i] += 1;
				end.truncate(i + 1);
				return end;
			}
		}
		// All 0xff: scan to the end of the keyspace.
		vec![0]
	}
}

#[derive(Deserialize)]
struct RangeResponse {
	#[serde(default)]
	kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
	value: String,
}

#[async_trait]
impl Source for EtcdSource {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self) -> anyhow::Result<Vec<Backend>> {
		let base = self.endpoint.strip_suffix('/').unwrap_or(&self.endpoint);
		let body = serde_json::json!({
			"key": B64.encode(self.prefix.as_bytes()),
			"range_end": B64.encode(Self::range_end(self.prefix.as_bytes())),
		});
		let resp: RangeResponse = self
			.client
			.post(format!("{base}/v3/kv/range"))
			.json(&body)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		let mut out = Vec::new();
		for (i, kv) in resp.kvs.into_iter().enumerate() {
			let raw = B64.decode(kv.value.as_bytes())?;
			let entry: WireBackend = serde_json::from_slice(&raw)?;
			if wire_status_enabled(&entry.status) {
				out.push(entry.into_backend(&self.name, i));
			}
		}
		Ok(out)
	}
}
