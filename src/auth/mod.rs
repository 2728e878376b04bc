use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::http::{HeaderMap, x_headers};
use crate::serdes::serde_dur;
use crate::storage::StorageManager;

mod cache;
pub mod credential;
mod file;
pub mod script;
mod sql;
mod webhook;

pub use cache::CacheProvider;
pub use credential::{CredentialRecord, StandardChecks, run_standard_checks};
pub use file::FileProvider;
pub use script::{DecisionScript, ScriptDecision};
pub use sql::SqlProvider;
pub use webhook::WebhookProvider;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthConfig {
	#[serde(default)]
	pub mode: PipelineMode,
	/// Header names tried in order for the API key; `Authorization` values
	/// are parsed as `Bearer <key>`.
	#[serde(default = "default_headers")]
	pub headers: Vec<String>,
	#[serde(default = "default_script_timeout", with = "serde_dur")]
	pub script_timeout: Duration,
	#[serde(default)]
	pub providers: Vec<ProviderConfig>,
}

impl Default for AuthConfig {
	fn default() -> Self {
		AuthConfig {
			mode: Default::default(),
			headers: default_headers(),
			script_timeout: default_script_timeout(),
			providers: Vec::new(),
		}
	}
}

fn default_headers() -> Vec<String> {
	vec!["Authorization".to_string()]
}

fn default_script_timeout() -> Duration {
	Duration::from_millis(100)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineMode {
	/// The first provider whose decision is allow terminates the pipeline.
	#[default]
	FirstMatch,
	/// Every enabled provider must allow; the credential comes from the
	/// last-succeeding provider.
	All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", deny_unknown_fields)]
pub enum ProviderConfig {
	#[serde(rename_all = "camelCase")]
	File {
		#[serde(default)]
		name: Option<String>,
		#[serde(default = "default_enabled")]
		enabled: bool,
		#[serde(default)]
		keys: Vec<CredentialRecord>,
		#[serde(default)]
		path: Option<String>,
		#[serde(default)]
		script: Option<String>,
		#[serde(default)]
		script_path: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	Cache {
		#[serde(default)]
		name: Option<String>,
		#[serde(default = "default_enabled")]
		enabled: bool,
		storage: String,
		#[serde(default = "default_key_template")]
		key_template: String,
		#[serde(default)]
		script: Option<String>,
		#[serde(default)]
		script_path: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	Sql {
		#[serde(default)]
		name: Option<String>,
		#[serde(default = "default_enabled")]
		enabled: bool,
		storage: String,
		#[serde(default = "default_table")]
		table: String,
		#[serde(default)]
		script: Option<String>,
		#[serde(default)]
		script_path: Option<String>,
	},
	#[serde(rename_all = "camelCase")]
	Webhook {
		#[serde(default)]
		name: Option<String>,
		#[serde(default = "default_enabled")]
		enabled: bool,
		url: String,
		#[serde(default = "default_webhook_timeout", with = "serde_dur")]
		timeout: Duration,
		#[serde(default)]
		script: Option<String>,
		#[serde(default)]
		script_path: Option<String>,
	},
}

fn default_enabled() -> bool {
	true
}
fn default_key_template() -> String {
	cache::DEFAULT_KEY_TEMPLATE.to_string()
}
fn default_table() -> String {
	sql::DEFAULT_TABLE.to_string()
}
fn default_webhook_timeout() -> Duration {
	Duration::from_secs(1)
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("provider unavailable: {0}")]
	Unavailable(String),
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

/// What a provider knows about a presented key.
#[derive(Debug)]
pub enum ProviderLookup {
	Found(CredentialRecord),
	NotFound,
	/// An explicit denial carried on the lookup itself (webhook responses).
	Deny {
		reason: Option<String>,
		code: Option<u16>,
	},
}

#[async_trait]
pub trait Provider: Send + Sync {
	fn name(&self) -> &str;
	async fn lookup(&self, ctx: &RequestContext) -> Result<ProviderLookup, AuthError>;
	/// Quota writeback, through the same provider that served the credential.
	async fn deduct(&self, key: &str, tokens: u64) -> Result<(), AuthError>;
	async fn reset_usage(&self, key: &str) -> Result<(), AuthError>;
}

/// The per-request inputs the pipeline (and its scripts) see.
#[derive(Debug, Clone)]
pub struct RequestContext {
	pub api_key: Option<String>,
	pub client_ip: IpAddr,
	pub method: String,
	pub path: String,
	/// Parsed request body, or `Null` when absent/unparseable. Opaque to the
	/// proxy; scripts may inspect it.
	pub body: serde_json::Value,
}

/// The result of running the pipeline for one request.
#[derive(Debug, Clone)]
pub struct Decision {
	pub allow: bool,
	pub reason: Option<String>,
	pub status: u16,
	pub credential: Option<CredentialRecord>,
	pub provider: Option<String>,
}

impl Decision {
	fn allowed(cred: CredentialRecord, provider: &str) -> Decision {
		Decision {
			allow: true,
			reason: None,
			status: 200,
			credential: Some(cred),
			provider: Some(provider.to_string()),
		}
	}

	fn anonymous() -> Decision {
		Decision {
			allow: true,
			reason: None,
			status: 200,
			credential: None,
			provider: None,
		}
	}

	fn denied(reason: impl Into<String>, status: u16) -> Decision {
		Decision {
			allow: false,
			reason: Some(reason.into()),
			status,
			credential: None,
			provider: None,
		}
	}
}

struct ProviderEntry {
	provider: Box<dyn Provider>,
	script: Option<DecisionScript>,
}

/// The ordered, script-driven decision engine in front of the proxy.
pub struct AuthPipeline {
	mode: PipelineMode,
	header_names: Vec<String>,
	script_timeout: Duration,
	providers: Vec<ProviderEntry>,
}

impl AuthPipeline {
	/// Build every enabled provider and compile every script. Any script
	/// that fails to parse (or unresolvable storage reference) aborts
	/// startup.
	pub fn new(cfg: &AuthConfig, storage: &StorageManager) -> anyhow::Result<AuthPipeline> {
		let mut providers: Vec<ProviderEntry> = Vec::new();
		for (i, pc) in cfg.providers.iter().enumerate() {
			let Some(entry) = build_provider(pc, i, storage)? else {
				continue;
			};
			providers.push(entry);
		}
		Ok(AuthPipeline {
			mode: cfg.mode,
			header_names: cfg.headers.clone(),
			script_timeout: cfg.script_timeout,
			providers,
		})
	}

	pub fn header_names(&self) -> &[String] {
		&self.header_names
	}

	pub fn has_providers(&self) -> bool {
		!self.providers.is_empty()
	}

	pub async fn run(&self, ctx: &RequestContext) -> Decision {
		if self.providers.is_empty() {
			return Decision::anonymous();
		}
		if ctx.api_key.is_none() {
			return Decision::denied("missing API key", 401);
		}

		let mut last_non_allow: Option<Decision> = None;
		let mut first_deny: Option<Decision> = None;
		let mut last_allowed: Option<Decision> = None;
		for entry in &self.providers {
			let decision = self.evaluate_provider(entry, ctx).await;
			debug!(
				provider = entry.provider.name(),
				allow = decision.allow,
				"provider decision"
			);
			match self.mode {
				PipelineMode::FirstMatch => {
					if decision.allow {
						return decision;
					}
					last_non_allow = Some(decision);
				},
				PipelineMode::All => {
					// A non-allow settles the outcome but does not stop the
					// remaining providers from being consulted.
					if decision.allow {
						last_allowed = Some(decision);
					} else if first_deny.is_none() {
						first_deny = Some(decision);
					}
				},
			}
		}
		match self.mode {
			PipelineMode::FirstMatch => {
				last_non_allow.unwrap_or_else(|| Decision::denied("unknown API key", 401))
			},
			PipelineMode::All => match first_deny {
				Some(deny) => deny,
				None => last_allowed.unwrap_or_else(|| Decision::denied("unknown API key", 401)),
			},
		}
	}

	async fn evaluate_provider(&self, entry: &ProviderEntry, ctx: &RequestContext) -> Decision {
		let name = entry.provider.name();
		let mut cred = match entry.provider.lookup(ctx).await {
			Ok(ProviderLookup::Found(cred)) => cred,
			Ok(ProviderLookup::NotFound) => return Decision::denied("unknown API key", 401),
			Ok(ProviderLookup::Deny { reason, code }) => {
				return Decision::denied(
					reason.unwrap_or_else(|| "denied by policy".to_string()),
					code.unwrap_or(403),
				);
			},
			Err(e) => {
				warn!(provider = name, "auth provider failed: {e}");
				return Decision::denied("authentication provider unavailable", 500);
			},
		};

		// Roll the usage window before quota is checked.
		if cred.reset_due(Utc::now()) {
			if let Err(e) = entry.provider.reset_usage(&cred.key).await {
				warn!(provider = name, "usage reset failed: {e}");
			}
			cred.used = 0;
			cred.last_reset = Some(Utc::now());
		}

		let checks = run_standard_checks(&cred, ctx.client_ip, Utc::now());
		let script_decision = match &entry.script {
			Some(script) => {
				script
					.evaluate(
						script_request(ctx),
						script_key_info(&cred),
						serde_json::to_value(checks).unwrap_or(serde_json::Value::Null),
						self.script_timeout,
					)
					.await
			},
			None => ScriptDecision::Defer,
		};

		match script_decision {
			ScriptDecision::Allow => Decision::allowed(cred, name),
			ScriptDecision::Deny { reason, code } => Decision::denied(
				reason.unwrap_or_else(|| "denied by policy".to_string()),
				code.unwrap_or(403),
			),
			ScriptDecision::Defer => match checks.failure() {
				None => Decision::allowed(cred, name),
				Some((reason, status)) => Decision::denied(reason, status),
			},
		}
	}

	/// Write a usage delta back through the provider that authenticated the
	/// request.
	pub async fn deduct(&self, provider: &str, key: &str, tokens: u64) {
		if tokens == 0 {
			return;
		}
		let Some(entry) = self
			.providers
			.iter()
			.find(|e| e.provider.name() == provider)
		else {
			return;
		};
		if let Err(e) = entry.provider.deduct(key, tokens).await {
			warn!(provider, "quota writeback failed: {e}");
		}
	}
}

fn script_request(ctx: &RequestContext) -> serde_json::Value {
	serde_json::json!({
		"method": ctx.method,
		"path": ctx.path,
		"client_ip": ctx.client_ip.to_string(),
		"body": ctx.body,
	})
}

fn script_key_info(cred: &CredentialRecord) -> serde_json::Value {
	serde_json::json!({
		"key": cred.key,
		"user_id": cred.user_id,
		"name": cred.name,
		"quota": cred.quota,
		"used": cred.used,
	})
}

fn build_provider(
	pc: &ProviderConfig,
	index: usize,
	storage: &StorageManager,
) -> anyhow::Result<Option<ProviderEntry>> {
	let load_script = |name: &str,
	                   script: &Option<String>,
	                   script_path: &Option<String>|
	 -> anyhow::Result<Option<DecisionScript>> {
		let source = match (script, script_path) {
			(Some(inline), _) => Some(inline.clone()),
			(None, Some(path)) => Some(std::fs::read_to_string(path)?),
			(None, None) => None,
		};
		source.map(|s| DecisionScript::compile(name, &s)).transpose()
	};
	let fallback_name =
		|name: &Option<String>, kind: &str| name.clone().unwrap_or_else(|| format!("{kind}-{index}"));

	Ok(match pc {
		ProviderConfig::File {
			name,
			enabled,
			keys,
			path,
			script,
			script_path,
		} => {
			if !enabled {
				return Ok(None);
			}
			let name = fallback_name(name, "file");
			let mut all = keys.clone();
			if let Some(p) = path {
				let contents = std::fs::read_to_string(p)?;
				let mut from_file: Vec<CredentialRecord> = serde_yaml::from_str(&contents)?;
				all.append(&mut from_file);
			}
			Some(ProviderEntry {
				script: load_script(&name, script, script_path)?,
				provider: Box::new(FileProvider::new(name, all)),
			})
		},
		ProviderConfig::Cache {
			name,
			enabled,
			storage: storage_name,
			key_template,
			script,
			script_path,
		} => {
			if !enabled {
				return Ok(None);
			}
			let name = fallback_name(name, "cache");
			let conn = storage
				.cache(storage_name)
				.ok_or_else(|| anyhow::anyhow!("unresolved storage reference {storage_name:?}"))?;
			Some(ProviderEntry {
				script: load_script(&name, script, script_path)?,
				provider: Box::new(CacheProvider::new(name, conn, key_template.clone())),
			})
		},
		ProviderConfig::Sql {
			name,
			enabled,
			storage: storage_name,
			table,
			script,
			script_path,
		} => {
			if !enabled {
				return Ok(None);
			}
			let name = fallback_name(name, "sql");
			let pool = storage
				.sql(storage_name)
				.ok_or_else(|| anyhow::anyhow!("unresolved storage reference {storage_name:?}"))?;
			let dialect = storage
				.sql_dialect(storage_name)
				.unwrap_or(crate::storage::SqlDialect::Sqlite);
			Some(ProviderEntry {
				script: load_script(&name, script, script_path)?,
				provider: Box::new(SqlProvider::new(name, pool, table, dialect)),
			})
		},
		ProviderConfig::Webhook {
			name,
			enabled,
			url,
			timeout,
			script,
			script_path,
		} => {
			if !enabled {
				return Ok(None);
			}
			let name = fallback_name(name, "webhook");
			Some(ProviderEntry {
				script: load_script(&name, script, script_path)?,
				provider: Box::new(WebhookProvider::new(name, url.clone(), *timeout)?),
			})
		},
	})
}

/// Extract the API key from the configured header list, in order.
/// `Authorization` is parsed as `Bearer <key>`; other headers carry the raw
/// key. Exactly one key per request: the first hit wins.
pub fn extract_api_key(headers: &HeaderMap, names: &[String]) -> Option<String> {
	for name in names {
		let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
			continue;
		};
		let value = value.trim();
		if value.is_empty() {
			continue;
		}
		if name.eq_ignore_ascii_case("authorization") {
			if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) {
				let token = token.trim();
				if !token.is_empty() {
					return Some(token.to_string());
				}
			}
			continue;
		}
		return Some(value.to_string());
	}
	None
}

/// Client IP: first hop of `X-Forwarded-For`, else `X-Real-IP`, else the
/// socket address. Ports are stripped.
pub fn extract_client_ip(headers: &HeaderMap, remote: SocketAddr) -> IpAddr {
	if let Some(xff) = headers
		.get(&x_headers::X_FORWARDED_FOR)
		.and_then(|v| v.to_str().ok())
	{
		if let Some(first) = xff.split(',').next() {
			if let Some(ip) = parse_ip_maybe_port(first.trim()) {
				return ip;
			}
		}
	}
	if let Some(real) = headers
		.get(&x_headers::X_REAL_IP)
		.and_then(|v| v.to_str().ok())
	{
		if let Some(ip) = parse_ip_maybe_port(real.trim()) {
			return ip;
		}
	}
	remote.ip()
}

fn parse_ip_maybe_port(raw: &str) -> Option<IpAddr> {
	if let Ok(ip) = IpAddr::from_str(raw) {
		return Some(ip);
	}
	// "1.2.3.4:5678" or "[::1]:5678"
	SocketAddr::from_str(raw).map(|sa| sa.ip()).ok()
}
