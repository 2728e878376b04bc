use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::serdes::serde_dur;
use crate::types::{Backend, BackendSnapshot};

mod health;

pub use health::Prober;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadBalanceConfig {
	#[serde(default)]
	pub strategy: StrategyKind,
	#[serde(default = "default_probe_interval", with = "serde_dur")]
	pub probe_interval: Duration,
	#[serde(default = "default_probe_path")]
	pub probe_path: String,
	#[serde(default = "default_probe_timeout", with = "serde_dur")]
	pub probe_timeout: Duration,
	/// Exact status the probe must return; unset means any 2xx.
	#[serde(default)]
	pub probe_expect_status: Option<u16>,
}

impl Default for LoadBalanceConfig {
	fn default() -> Self {
		LoadBalanceConfig {
			strategy: Default::default(),
			probe_interval: default_probe_interval(),
			probe_path: default_probe_path(),
			probe_timeout: default_probe_timeout(),
			probe_expect_status: None,
		}
	}
}

fn default_probe_interval() -> Duration {
	Duration::from_secs(10)
}
fn default_probe_path() -> String {
	"/health".to_string()
}
fn default_probe_timeout() -> Duration {
	Duration::from_secs(3)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
	#[default]
	RoundRobin,
	LeastConn,
	Latency,
}

const INITIAL_LATENCY_MS: f64 = 100.0;
const EMA_ALPHA: f64 = 0.3;

/// Mutable per-backend feedback, keyed by URL so it survives snapshot swaps.
#[derive(Debug)]
struct Feedback {
	healthy: bool,
	inflight: u64,
	ema_ms: f64,
	credit: i64,
}

impl Default for Feedback {
	fn default() -> Self {
		Feedback {
			// A backend is selectable until the first probe says otherwise.
			healthy: true,
			inflight: 0,
			ema_ms: INITIAL_LATENCY_MS,
			credit: 0,
		}
	}
}

/// Selects one healthy backend per request and records latency/concurrency
/// feedback. `next` is safe under concurrent callers and never blocks
/// waiting for health recovery; with no healthy backend it returns `None`
/// and the caller surfaces 503.
pub struct Balancer {
	strategy: StrategyKind,
	state: Mutex<HashMap<String, Feedback>>,
}

/// Feedback is keyed by URL; normalize so `http://b/` and `http://b` share
/// an entry regardless of which form the caller saw.
fn norm(url: &str) -> &str {
	url.strip_suffix('/').unwrap_or(url)
}

impl Balancer {
	pub fn new(strategy: StrategyKind) -> Balancer {
		Balancer {
			strategy,
			state: Mutex::new(HashMap::new()),
		}
	}

	/// Pick a backend out of the caller's snapshot. The critical section is
	/// O(#backends) of arithmetic; no I/O happens under the lock.
	pub fn next(&self, snapshot: &BackendSnapshot) -> Option<Arc<Backend>> {
		let mut state = self.state.lock().expect("poisoned");
		// Lazy GC: feedback for backends that left the snapshot is dropped
		// once nothing is in flight against them.
		state.retain(|url, fb| fb.inflight > 0 || snapshot.by_url(url).is_some());
		for b in snapshot.backends.iter() {
			state.entry(norm(&b.url).to_string()).or_default();
		}

		let healthy: Vec<&Arc<Backend>> = snapshot
			.backends
			.iter()
			.filter(|b| {
				state
					.get(norm(&b.url))
					.map(|f| f.healthy)
					.unwrap_or(true)
			})
			.collect();
		if healthy.is_empty() {
			return None;
		}

		let chosen = match self.strategy {
			StrategyKind::RoundRobin => {
				// Smooth weighted round-robin: every selection adds each
				// backend's weight to its credit, the highest credit wins and
				// pays back the total weight.
				let total: i64 = healthy.iter().map(|b| b.weight as i64).sum();
				let mut best: Option<&Arc<Backend>> = None;
				let mut best_credit = i64::MIN;
				for &b in &healthy {
					let fb = state.get_mut(norm(&b.url)).expect("entry just inserted");
					fb.credit += b.weight as i64;
					if fb.credit > best_credit {
						best_credit = fb.credit;
						best = Some(b);
					}
				}
				let best = best?;
				state.get_mut(norm(&best.url)).expect("entry just inserted").credit -= total;
				best.clone()
			},
			StrategyKind::LeastConn => {
				let mut best: Option<&Arc<Backend>> = None;
				let mut best_inflight = u64::MAX;
				for &b in &healthy {
					let inflight = state.get(norm(&b.url)).map(|f| f.inflight).unwrap_or(0);
					if inflight < best_inflight {
						best_inflight = inflight;
						best = Some(b);
					}
				}
				let best = best?.clone();
				state.get_mut(norm(&best.url)).expect("entry just inserted").inflight += 1;
				best
			},
			StrategyKind::Latency => {
				let mut best: Option<&Arc<Backend>> = None;
				let mut best_ms = f64::INFINITY;
				for &b in &healthy {
					let ms = state
						.get(norm(&b.url))
						.map(|f| f.ema_ms)
						.unwrap_or(INITIAL_LATENCY_MS);
					if ms < best_ms {
						best_ms = ms;
						best = Some(b);
					}
				}
				best?.clone()
			},
		};
		Some(chosen)
	}

	pub fn update_health(&self, url: &str, healthy: bool) -> bool {
		let mut state = self.state.lock().expect("poisoned");
		let fb = state.entry(norm(url).to_string()).or_default();
		let changed = fb.healthy != healthy;
		fb.healthy = healthy;
		changed
	}

	pub fn is_healthy(&self, url: &str) -> bool {
		let state = self.state.lock().expect("poisoned");
		state.get(norm(url)).map(|f| f.healthy).unwrap_or(true)
	}

	/// Record the outcome of one backend attempt. The in-flight counter is
	/// decremented on success and failure alike; latency only updates on
	/// success so a broken backend is not made attractive by fast refusals.
	pub fn record_result(&self, url: &str, latency: Duration, ok: bool) {
		let mut state = self.state.lock().expect("poisoned");
		let fb = state.entry(norm(url).to_string()).or_default();
		if self.strategy == StrategyKind::LeastConn {
			fb.inflight = fb.inflight.saturating_sub(1);
		}
		if ok {
			let observed = latency.as_secs_f64() * 1000.0;
			fb.ema_ms = EMA_ALPHA * observed + (1.0 - EMA_ALPHA) * fb.ema_ms;
		}
	}

	#[cfg(test)]
	fn inflight(&self, url: &str) -> u64 {
		let state = self.state.lock().expect("poisoned");
		state.get(norm(url)).map(|f| f.inflight).unwrap_or(0)
	}

	#[cfg(test)]
	fn ema_ms(&self, url: &str) -> f64 {
		let state = self.state.lock().expect("poisoned");
		state.get(norm(url)).map(|f| f.ema_ms).unwrap_or(INITIAL_LATENCY_MS)
	}
}

/// Everything the proxy needs for routing: the balancer plus the snapshot
/// feed, started together.
pub struct LoadBalancer {
	pub balancer: Arc<Balancer>,
	snapshot: watch::Receiver<Arc<BackendSnapshot>>,
}

impl LoadBalancer {
	pub fn new(
		cfg: &LoadBalanceConfig,
		snapshot: watch::Receiver<Arc<BackendSnapshot>>,
	) -> LoadBalancer {
		LoadBalancer {
			balancer: Arc::new(Balancer::new(cfg.strategy)),
			snapshot,
		}
	}

	/// The snapshot the request will use for its entire lifetime.
	pub fn snapshot(&self) -> Arc<BackendSnapshot> {
		self.snapshot.borrow().clone()
	}

	pub fn start_prober(
		&self,
		cfg: &LoadBalanceConfig,
		metrics: Arc<crate::mtrcs::Metrics>,
		cancel: CancellationToken,
	) {
		let prober = Prober::new(cfg, self.balancer.clone(), self.snapshot.clone(), metrics);
		tokio::spawn(prober.run(cancel));
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn snapshot(weights: &[(&str, u32)]) -> BackendSnapshot {
		BackendSnapshot::new(
			weights
				.iter()
				.map(|(n, w)| Backend::new(*n, format!("http://{n}:8000")).with_weight(*w))
				.collect(),
			1,
		)
	}

	#[test]
	fn round_robin_is_weight_fair() {
		let snap = snapshot(&[("a", 5), ("b", 1), ("c", 1)]);
		let lb = Balancer::new(StrategyKind::RoundRobin);
		let rounds = 10;
		let total: u32 = 7;
		let mut counts: HashMap<String, u32> = HashMap::new();
		for _ in 0..rounds * total {
			let b = lb.next(&snap).unwrap();
			*counts.entry(b.name.clone()).or_default() += 1;
		}
		assert_eq!(counts["a"], rounds * 5);
		assert_eq!(counts["b"], rounds);
		assert_eq!(counts["c"], rounds);
	}

	#[test]
	fn round_robin_equal_weights_is_deterministic() {
		let snap = snapshot(&[("a", 1), ("b", 1), ("c", 1)]);
		let lb = Balancer::new(StrategyKind::RoundRobin);
		let picks: Vec<String> = (0..6).map(|_| lb.next(&snap).unwrap().name.clone()).collect();
		assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
	}

	#[test]
	fn round_robin_skips_unhealthy() {
		let snap = snapshot(&[("a", 1), ("b", 1)]);
		let lb = Balancer::new(StrategyKind::RoundRobin);
		lb.update_health("http://a:8000", false);
		for _ in 0..4 {
			assert_eq!(lb.next(&snap).unwrap().name, "b");
		}
		lb.update_health("http://a:8000", true);
		let names: Vec<String> = (0..2).map(|_| lb.next(&snap).unwrap().name.clone()).collect();
		assert!(names.contains(&"a".to_string()));
	}

	#[test]
	fn no_healthy_backend_returns_none() {
		let snap = snapshot(&[("a", 1)]);
		let lb = Balancer::new(StrategyKind::RoundRobin);
		lb.update_health("http://a:8000", false);
		assert!(lb.next(&snap).is_none());
	}

	#[test]
	fn least_conn_picks_minimum_and_ties_go_low() {
		let snap = snapshot(&[("a", 1), ("b", 1)]);
		let lb = Balancer::new(StrategyKind::LeastConn);
		// First selection ties at 0 in-flight: lowest index wins.
		assert_eq!(lb.next(&snap).unwrap().name, "a");
		// Now a has 1 in flight, b has 0.
		assert_eq!(lb.next(&snap).unwrap().name, "b");
		assert_eq!(lb.inflight("http://a:8000"), 1);
		assert_eq!(lb.inflight("http://b:8000"), 1);

		// Completion decrements regardless of outcome.
		lb.record_result("http://a:8000", Duration::from_millis(10), false);
		assert_eq!(lb.inflight("http://a:8000"), 0);
		assert_eq!(lb.next(&snap).unwrap().name, "a");
	}

	#[test]
	fn latency_ema_prefers_fast_and_ignores_failures() {
		let snap = snapshot(&[("a", 1), ("b", 1)]);
		let lb = Balancer::new(StrategyKind::Latency);
		// Both start at the initial estimate; lowest index wins the tie.
		assert_eq!(lb.next(&snap).unwrap().name, "a");

		lb.record_result("http://a:8000", Duration::from_millis(300), true);
		// 0.3*300 + 0.7*100 = 160
		assert!((lb.ema_ms("http://a:8000") - 160.0).abs() < 1e-9);
		assert_eq!(lb.next(&snap).unwrap().name, "b");

		// A failing backend keeps its estimate: fast refusals don't attract.
		lb.record_result("http://b:8000", Duration::from_millis(1), false);
		assert!((lb.ema_ms("http://b:8000") - INITIAL_LATENCY_MS).abs() < 1e-9);
		assert_eq!(lb.next(&snap).unwrap().name, "b");
	}

	#[test]
	fn feedback_outlives_snapshot_swap() {
		let snap1 = snapshot(&[("a", 1), ("b", 1)]);
		let lb = Balancer::new(StrategyKind::Latency);
		lb.record_result("http://a:8000", Duration::from_millis(500), true);
		let a_ema = lb.ema_ms("http://a:8000");

		// New snapshot still containing a: feedback survives.
		let snap2 = snapshot(&[("a", 1)]);
		let _ = lb.next(&snap2);
		assert!((lb.ema_ms("http://a:8000") - a_ema).abs() < 1e-9);

		// Snapshot without a: feedback is garbage collected on the next pick.
		let snap3 = snapshot(&[("b", 1)]);
		let _ = lb.next(&snap3);
		assert!((lb.ema_ms("http://a:8000") - INITIAL_LATENCY_MS).abs() < 1e-9);
	}
}
