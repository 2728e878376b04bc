use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Balancer, LoadBalanceConfig};
use crate::types::BackendSnapshot;

/// Periodic liveness probing shared by every strategy. Each backend gets its
/// own probe task per tick so a slow backend cannot delay the others; a
/// single probe decides the transition (no flap damping).
pub struct Prober {
	balancer: Arc<Balancer>,
	snapshot: watch::Receiver<Arc<BackendSnapshot>>,
	client: reqwest::Client,
	interval: Duration,
	path: String,
	expect_status: Option<u16>,
	metrics: Arc<crate::mtrcs::Metrics>,
}

impl Prober {
	pub fn new(
		cfg: &LoadBalanceConfig,
		balancer: Arc<Balancer>,
		snapshot: watch::Receiver<Arc<BackendSnapshot>>,
		metrics: Arc<crate::mtrcs::Metrics>,
	) -> Prober {
		let client = reqwest::Client::builder()
			.timeout(cfg.probe_timeout)
			.build()
			.expect("probe client construction cannot fail");
		Prober {
			balancer,
			snapshot,
			client,
			interval: cfg.probe_interval,
			path: cfg.probe_path.clone(),
			expect_status: cfg.probe_expect_status,
			metrics,
		}
	}

	pub async fn run(self, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		// The interval's first tick is immediate; backends start selectable,
		// so the first real probe happens after one full interval.
		ticker.tick().await;
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					debug!("health prober stopped");
					return;
				},
				_ = ticker.tick() => {},
			}
			let snapshot = self.snapshot.borrow().clone();
			for backend in snapshot.backends.iter() {
				let url = format!("{}{}", backend.normalized_url(), self.path);
				let backend_url = backend.url.clone();
				let client = self.client.clone();
				let balancer = self.balancer.clone();
				let metrics = self.metrics.clone();
				let expect = self.expect_status;
				tokio::spawn(async move {
					let healthy = match client.get(&url).send().await {
						Ok(resp) => match expect {
							Some(code) => resp.status().as_u16() == code,
							None => resp.status().is_success(),
						},
						Err(e) => {
							debug!(backend = %backend_url, "probe request failed: {e}");
							false
						},
					};
					if balancer.update_health(&backend_url, healthy) {
						metrics.probe_transitions.inc();
						if healthy {
							info!(backend = %backend_url, "backend became healthy");
						} else {
							warn!(backend = %backend_url, "backend became unhealthy");
						}
					}
				});
			}
		}
	}
}
