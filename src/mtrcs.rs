use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Operational counters. Exposition beyond the text endpoint is delegated;
/// asynchronous-path failures must still be countable.
pub struct Metrics {
	registry: Registry,
	pub requests: Counter,
	pub auth_rejected: Counter,
	pub rate_limited: Counter,
	pub upstream_retries: Counter,
	pub usage_records: Counter,
	pub usage_dropped: Counter,
	pub probe_transitions: Counter,
}

impl Metrics {
	pub fn new() -> Metrics {
		let mut registry = Registry::with_prefix("llmproxy");
		let requests = Counter::default();
		registry.register("requests", "Requests received", requests.clone());
		let auth_rejected = Counter::default();
		registry.register(
			"auth_rejected",
			"Requests rejected by the auth pipeline",
			auth_rejected.clone(),
		);
		let rate_limited = Counter::default();
		registry.register(
			"rate_limited",
			"Requests rejected by the rate limiter",
			rate_limited.clone(),
		);
		let upstream_retries = Counter::default();
		registry.register(
			"upstream_retries",
			"Backend attempts beyond the first",
			upstream_retries.clone(),
		);
		let usage_records = Counter::default();
		registry.register(
			"usage_records",
			"Usage records enqueued",
			usage_records.clone(),
		);
		let usage_dropped = Counter::default();
		registry.register(
			"usage_dropped",
			"Usage records dropped (queue saturation or delivery failure)",
			usage_dropped.clone(),
		);
		let probe_transitions = Counter::default();
		registry.register(
			"probe_transitions",
			"Backend health state transitions",
			probe_transitions.clone(),
		);
		Metrics {
			registry,
			requests,
			auth_rejected,
			rate_limited,
			upstream_retries,
			usage_records,
			usage_dropped,
			probe_transitions,
		}
	}

	pub fn encode(&self) -> String {
		let mut out = String::new();
		let _ = prometheus_client::encoding::text::encode(&mut out, &self.registry);
		out
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_appear_in_exposition() {
		let m = Metrics::new();
		m.requests.inc();
		m.usage_dropped.inc();
		let text = m.encode();
		assert!(text.contains("llmproxy_requests_total 1"));
		assert!(text.contains("llmproxy_usage_dropped_total 1"));
	}
}
