use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::auth::AuthConfig;
use crate::discovery::DiscoveryConfig;
use crate::http::cors::Cors;
use crate::loadbalance::LoadBalanceConfig;
use crate::ratelimit::RateLimitConfig;
use crate::router::{FallbackRule, RetryConfig};
use crate::serdes::serde_dur;
use crate::storage::StorageConfig;
use crate::telemetry::LogFormat;
use crate::usage::UsageConfig;

/// The whole configuration surface, one YAML document. Unknown fields are
/// rejected so typos fail at startup instead of silently doing nothing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	#[serde(default = "default_listen")]
	pub listen: SocketAddr,
	#[serde(default = "default_grace_period", with = "serde_dur")]
	pub grace_period: Duration,
	#[serde(default = "default_read_timeout", with = "serde_dur")]
	pub read_timeout: Duration,
	#[serde(default = "default_connect_timeout", with = "serde_dur")]
	pub connect_timeout: Duration,
	/// Cap on buffered request bodies and on response bodies inspected for
	/// usage extraction.
	#[serde(default = "default_body_limit")]
	pub body_limit: usize,
	#[serde(default)]
	pub logging: LoggingConfig,
	#[serde(default)]
	pub cors: Option<Cors>,
	#[serde(default)]
	pub storage: Vec<StorageConfig>,
	#[serde(default)]
	pub discovery: DiscoveryConfig,
	#[serde(default)]
	pub load_balance: LoadBalanceConfig,
	#[serde(default)]
	pub auth: AuthConfig,
	#[serde(default)]
	pub rate_limit: Option<RateLimitConfig>,
	/// Ordered fallback rules consulted before the load balancer.
	#[serde(default)]
	pub routes: Vec<FallbackRule>,
	#[serde(default)]
	pub retry: RetryConfig,
	#[serde(default)]
	pub usage: UsageConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggingConfig {
	#[serde(default)]
	pub format: LogFormat,
}

fn default_listen() -> SocketAddr {
	"0.0.0.0:8080".parse().expect("static address parses")
}
fn default_grace_period() -> Duration {
	Duration::from_secs(10)
}
fn default_read_timeout() -> Duration {
	Duration::from_secs(60)
}
fn default_connect_timeout() -> Duration {
	Duration::from_secs(10)
}
fn default_body_limit() -> usize {
	2 * 1024 * 1024
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let contents = if contents.trim().is_empty() {
		"{}"
	} else {
		contents
	};
	let mut config: Config = serde_yaml::from_str(contents).context("parsing configuration")?;

	if let Some(listen) = parse_env::<SocketAddr>("LLMPROXY_LISTEN")? {
		config.listen = listen;
	}
	if let Some(cfg) = &config.rate_limit {
		if cfg.store == crate::ratelimit::StoreKind::Cache && cfg.storage.is_none() {
			anyhow::bail!("rateLimit.store is cache but rateLimit.storage is not set");
		}
	}
	Ok(config)
}

fn parse_env<T: std::str::FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as std::str::FromStr>::Err: ToString,
{
	match std::env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as std::str::FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}
