use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{AuthError, Provider, ProviderLookup, RequestContext};
use crate::auth::credential::CredentialRecord;

/// Credentials loaded once at startup from inline config or a YAML file.
/// Quota counters (and resets) live in memory only; a restart reinstates
/// whatever the file declared.
pub struct FileProvider {
	name: String,
	keys: Mutex<HashMap<String, CredentialRecord>>,
}

impl FileProvider {
	pub fn new(name: String, keys: Vec<CredentialRecord>) -> FileProvider {
		FileProvider {
			name,
			keys: Mutex::new(keys.into_iter().map(|k| (k.key.clone(), k)).collect()),
		}
	}

}

#[async_trait]
impl Provider for FileProvider {
	fn name(&self) -> &str {
		&self.name
	}

	async fn lookup(&self, ctx: &RequestContext) -> Result<ProviderLookup, AuthError> {
		let Some(key) = ctx.api_key.as_deref() else {
			return Ok(ProviderLookup::NotFound);
		};
		let keys = self.keys.lock().expect("poisoned");
		Ok(match keys.get(key) {
			Some(cred) => ProviderLookup::Found(cred.clone()),
			None => ProviderLookup::NotFound,
		})
	}

	async fn deduct(&self, key: &str, tokens: u64) -> Result<(), AuthError> {
		let mut keys = self.keys.lock().expect("poisoned");
		if let Some(cred) = keys.get_mut(key) {
			cred.used = cred.used.saturating_add(tokens);
		}
		Ok(())
	}

	async fn reset_usage(&self, key: &str) -> Result<(), AuthError> {
		let mut keys = self.keys.lock().expect("poisoned");
		if let Some(cred) = keys.get_mut(key) {
			cred.used = 0;
			cred.last_reset = Some(Utc::now());
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	fn ctx(key: &str) -> RequestContext {
		RequestContext {
			api_key: Some(key.to_string()),
			client_ip: "127.0.0.1".parse().unwrap(),
			method: "POST".to_string(),
			path: "/v1/chat/completions".to_string(),
			body: serde_json::Value::Null,
		}
	}

	#[tokio::test]
	async fn lookup_deduct_reset() {
		let mut cred = CredentialRecord::new("sk-test");
		cred.quota = 100;
		cred.reset_period = Some(Duration::from_secs(0));
		let p = FileProvider::new("file".to_string(), vec![cred]);

		assert!(matches!(
			p.lookup(&ctx("sk-test")).await.unwrap(),
			ProviderLookup::Found(_)
		));
		assert!(matches!(
			p.lookup(&ctx("other")).await.unwrap(),
			ProviderLookup::NotFound
		));

		p.deduct("sk-test", 40).await.unwrap();
		let ProviderLookup::Found(cred) = p.lookup(&ctx("sk-test")).await.unwrap() else {
			panic!("expected credential");
		};
		assert_eq!(cred.used, 40);

		// Reset is in-memory: used drops to zero and last_reset is stamped.
		p.reset_usage("sk-test").await.unwrap();
		let ProviderLookup::Found(cred) = p.lookup(&ctx("sk-test")).await.unwrap() else {
			panic!("expected credential");
		};
		assert_eq!(cred.used, 0);
		assert!(cred.last_reset.is_some());
	}
}
