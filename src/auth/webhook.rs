use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AuthError, Provider, ProviderLookup, RequestContext};
use crate::auth::credential::CredentialRecord;

/// Delegates the decision to an external service: a POST with the request
/// metadata, answered with a decision and (optionally) the credential
/// record. Non-2xx and timeouts mark the provider unavailable, which the
/// pipeline maps per combination mode.
pub struct WebhookProvider {
	name: String,
	url: String,
	client: reqwest::Client,
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
	api_key: &'a str,
	client_ip: String,
	method: &'a str,
	path: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
	#[serde(default = "default_allow")]
	allow: bool,
	#[serde(default)]
	reason: Option<String>,
	#[serde(default)]
	status_code: Option<u16>,
	#[serde(default)]
	key_info: Option<CredentialRecord>,
}

fn default_allow() -> bool {
	true
}

impl WebhookProvider {
	pub fn new(name: String, url: String, timeout: Duration) -> anyhow::Result<WebhookProvider> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(WebhookProvider { name, url, client })
	}
}

#[async_trait]
impl Provider for WebhookProvider {
	fn name(&self) -> &str {
		&self.name
	}

	async fn lookup(&self, ctx: &RequestContext) -> Result<ProviderLookup, AuthError> {
		let Some(api_key) = ctx.api_key.as_deref() else {
			return Ok(ProviderLookup::NotFound);
		};
		let payload = WebhookRequest {
			api_key,
			client_ip: ctx.client_ip.to_string(),
			method: &ctx.method,
			path: &ctx.path,
		};
		let resp = self
			.client
			.post(&self.url)
			.json(&payload)
			.send()
			.await
			.map_err(|e| AuthError::Unavailable(e.to_string()))?;
		if !resp.status().is_success() {
			return Err(AuthError::Unavailable(format!(
				"webhook returned {}",
				resp.status()
			)));
		}
		let decision: WebhookResponse = resp
			.json()
			.await
			.map_err(|e| AuthError::Unavailable(e.to_string()))?;

		if !decision.allow {
			return Ok(ProviderLookup::Deny {
				reason: decision.reason,
				code: decision.status_code,
			});
		}
		let cred = decision.key_info.unwrap_or_else(|| {
			// An allow without a record still authenticates; synthesize a
			// minimal credential so downstream accounting has a key.
			CredentialRecord::new(api_key)
		});
		Ok(ProviderLookup::Found(cred))
	}

	async fn deduct(&self, _key: &str, _tokens: u64) -> Result<(), AuthError> {
		// The webhook owner accounts on its side of the fence.
		Ok(())
	}

	async fn reset_usage(&self, _key: &str) -> Result<(), AuthError> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{body_partial_json, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn ctx() -> RequestContext {
		RequestContext {
			api_key: Some("sk-hook".to_string()),
			client_ip: "198.51.100.9".parse().unwrap(),
			method: "POST".to_string(),
			path: "/v1/chat/completions".to_string(),
			body: serde_json::Value::Null,
		}
	}

	#[tokio::test]
	async fn allow_with_credential() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/check"))
			.and(body_partial_json(serde_json::json!({"api_key": "sk-hook"})))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"allow": true,
				"keyInfo": {"key": "sk-hook", "userId": "u9", "quota": 50}
			})))
			.mount(&server)
			.await;

		let p = WebhookProvider::new(
			"hook".to_string(),
			format!("{}/check", server.uri()),
			Duration::from_secs(1),
		)
		.unwrap();
		let ProviderLookup::Found(cred) = p.lookup(&ctx()).await.unwrap() else {
			panic!("expected credential");
		};
		assert_eq!(cred.user_id, "u9");
		assert_eq!(cred.quota, 50);
	}

	#[tokio::test]
	async fn deny_carries_reason_and_code() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"allow": false, "reason": "blocked", "statusCode": 403
			})))
			.mount(&server)
			.await;

		let p =
			WebhookProvider::new("hook".to_string(), server.uri(), Duration::from_secs(1)).unwrap();
		match p.lookup(&ctx()).await.unwrap() {
			ProviderLookup::Deny { reason, code } => {
				assert_eq!(reason.as_deref(), Some("blocked"));
				assert_eq!(code, Some(403));
			},
			other => panic!("unexpected: {other:?}"),
		}
	}

	#[tokio::test]
	async fn non_2xx_is_unavailable() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let p =
			WebhookProvider::new("hook".to_string(), server.uri(), Duration::from_secs(1)).unwrap();
		assert!(matches!(
			p.lookup(&ctx()).await,
			Err(AuthError::Unavailable(_))
		));
	}
}
