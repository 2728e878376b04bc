use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::StatusCode;
use crate::serdes::serde_dur;

/// An ordered fallback rule: requests whose model matches one of the
/// patterns go to `primary`, then to each fallback in turn. An empty
/// pattern set matches everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FallbackRule {
	#[serde(default)]
	pub models: Vec<String>,
	pub primary: String,
	#[serde(default)]
	pub fallbacks: Vec<String>,
}

impl FallbackRule {
	pub fn matches(&self, model: Option<&str>) -> bool {
		if self.models.is_empty() {
			return true;
		}
		let Some(model) = model else {
			return false;
		};
		self.models.iter().any(|p| pattern_matches(p, model))
	}

	/// Primary plus fallbacks, in failure order.
	pub fn targets(&self) -> impl Iterator<Item = &str> {
		std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(|s| s.as_str()))
	}
}

/// `*` is a suffix wildcard: `gpt-4*` matches `gpt-4o`; a bare `*` matches
/// anything.
fn pattern_matches(pattern: &str, model: &str) -> bool {
	match pattern.strip_suffix('*') {
		Some(prefix) => model.starts_with(prefix),
		None => pattern == model,
	}
}

/// Consult the rules in order; the first match wins. `None` defers routing
/// entirely to the load balancer.
pub fn select_rule<'a>(rules: &'a [FallbackRule], model: Option<&str>) -> Option<&'a FallbackRule> {
	rules.iter().find(|r| r.matches(model))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryConfig {
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_initial_backoff", with = "serde_dur")]
	pub initial_backoff: Duration,
	#[serde(default = "default_multiplier")]
	pub multiplier: f64,
	#[serde(default = "default_max_backoff", with = "serde_dur")]
	pub max_backoff: Duration,
}

impl Default for RetryConfig {
	fn default() -> Self {
		RetryConfig {
			max_retries: default_max_retries(),
			initial_backoff: default_initial_backoff(),
			multiplier: default_multiplier(),
			max_backoff: default_max_backoff(),
		}
	}
}

fn default_max_retries() -> u32 {
	3
}
fn default_initial_backoff() -> Duration {
	Duration::from_millis(100)
}
fn default_multiplier() -> f64 {
	2.0
}
fn default_max_backoff() -> Duration {
	Duration::from_secs(5)
}

impl RetryConfig {
	/// Wait before retry attempt `k` (k >= 1): `initial * multiplier^(k-1)`,
	/// capped at `max_backoff`.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
		let wait = self.initial_backoff.as_secs_f64() * exp;
		Duration::from_secs_f64(wait.min(self.max_backoff.as_secs_f64()))
	}
}

/// Retriable responses: 5xx and 429. Everything else (2xx, other 4xx) is
/// final. Network-layer failures are always retriable and handled where the
/// error is observed.
pub fn retryable_status(status: StatusCode) -> bool {
	status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
