use async_trait::async_trait;
use serde::Deserialize;

use super::Source;
use crate::types::Backend;

pub fn default_api_server() -> String {
	"https://kubernetes.default.svc".to_string()
}

pub fn default_token_path() -> String {
	"/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

/// Reads the `Endpoints` resource for a service through the API server,
/// authenticating with the in-pod service-account bearer token.
pub struct KubernetesSource {
	name: String,
	api_server: String,
	namespace: String,
	service: String,
	token_path: String,
	client: reqwest::Client,
}

impl KubernetesSource {
	pub fn new(
		name: String,
		api_server: String,
		namespace: String,
		service: String,
		token_path: String,
		insecure: bool,
	) -> anyhow::Result<Self> {
		// The API server speaks TLS with the cluster CA; insecure mode is for
		// dev clusters and kubectl-proxy setups.
		let client = reqwest::Client::builder()
			.danger_accept_invalid_certs(insecure)
			.timeout(std::time::Duration::from_secs(10))
			.build()?;
		Ok(KubernetesSource {
			name,
			api_server,
			namespace,
			service,
			token_path,
			client,
		})
	}
}

#[derive(Deserialize)]
struct Endpoints {
	#[serde(default)]
	subsets: Vec<Subset>,
}

#[derive(Deserialize)]
struct Subset {
	#[serde(default)]
	addresses: Vec<Address>,
	#[serde(default)]
	ports: Vec<Port>,
}

#[derive(Deserialize)]
struct Address {
	ip: String,
}

#[derive(Deserialize)]
struct Port {
	port: u16,
}

#[async_trait]
impl Source for KubernetesSource {
	fn name(&self) -> &str {
		&self.name
	}

	async fn fetch(&self) -> anyhow::Result<Vec<Backend>> {
		let base = self.api_server.strip_suffix('/').unwrap_or(&self.api_server);
		let url = format!(
			"{base}/api/v1/namespaces/{}/endpoints/{}",
			self.namespace, self.service
		);
		let mut req = self.client.get(url);
		match tokio::fs::read_to_string(&self.token_path).await {
			Ok(token) => req = req.bearer_auth(token.trim()),
			Err(e) => {
				// Outside a pod there may legitimately be no token (e.g. kubectl proxy).
				tracing::debug!(path = %self.token_path, "no service account token: {e}");
			},
		}
		let eps: Endpoints = req.send().await?.error_for_status()?.json().await?;
		let mut out = Vec::new();
		for subset in eps.subsets {
			for port in &subset.ports {
				for addr in &subset.addresses {
					out.push(Backend::new(
						format!("{}-{}-{}", self.service, addr.ip, port.port),
						format!("http://{}:{}", addr.ip, port.port),
					));
				}
			}
		}
		Ok(out)
	}
}
