use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::AuthPipeline;
use crate::config::Config;
use crate::discovery::DiscoveryManager;
use crate::loadbalance::LoadBalancer;
use crate::mtrcs::Metrics;
use crate::proxy::httpproxy::ProxyInputs;
use crate::proxy::{Gateway, UpstreamClient};
use crate::ratelimit::RateLimiter;
use crate::storage::StorageManager;
use crate::usage::UsageReporter;

/// Wire every subsystem and start serving. Configuration problems
/// (unopenable storage, script parse failures, unbindable listener) abort
/// here, before the process is considered up.
pub async fn run(config: Arc<Config>) -> anyhow::Result<Bound> {
	let cancel = CancellationToken::new();
	let metrics = Arc::new(Metrics::new());

	let storage = Arc::new(
		StorageManager::connect(&config.storage)
			.await
			.context("storage manager starts")?,
	);

	let discovery_client = reqwest::Client::builder()
		.timeout(std::time::Duration::from_secs(10))
		.build()
		.context("discovery client")?;
	let discovery = Arc::new(
		DiscoveryManager::new(&config.discovery, &storage, discovery_client)
			.context("discovery manager starts")?,
	);
	let lb = LoadBalancer::new(&config.load_balance, discovery.watch());
	lb.start_prober(&config.load_balance, metrics.clone(), cancel.child_token());
	// Take the first snapshot before serving so early requests don't race an
	// empty backend set.
	discovery.poll_once().await;
	tokio::spawn(discovery.clone().run(cancel.child_token()));

	let auth = Arc::new(AuthPipeline::new(&config.auth, &storage).context("auth pipeline starts")?);
	let limiter = config
		.rate_limit
		.as_ref()
		.map(|cfg| RateLimiter::from_config(cfg, &storage).map(Arc::new))
		.transpose()
		.context("rate limiter starts")?;
	let reporter = Arc::new(
		UsageReporter::new(&config.usage, &storage, metrics.clone())
			.context("usage reporter starts")?,
	);
	let upstream = UpstreamClient::new(config.connect_timeout, config.read_timeout)
		.context("upstream client")?;

	let inputs = Arc::new(ProxyInputs {
		cors: config.cors.clone(),
		cfg: config.clone(),
		auth,
		limiter,
		lb,
		upstream,
		reporter,
		metrics,
	});

	let gateway = Gateway::bind(config.listen, inputs).await.context("bind")?;
	let local_addr = gateway.local_addr();
	let gateway_task = tokio::spawn(gateway.run(cancel.child_token()));

	Ok(Bound {
		cancel,
		gateway_task,
		storage,
		local_addr,
	})
}

pub struct Bound {
	pub local_addr: SocketAddr,
	cancel: CancellationToken,
	gateway_task: JoinHandle<()>,
	storage: Arc<StorageManager>,
}

impl Bound {
	/// Serve until SIGINT/SIGTERM, then drain and close.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		shutdown_signal().await;
		self.stop().await
	}

	/// Cancel background work, wait for the gateway to drain, release
	/// storage handles.
	pub async fn stop(self) -> anyhow::Result<()> {
		info!("shutting down");
		self.cancel.cancel();
		let _ = self.gateway_task.await;
		self.storage.close().await;
		Ok(())
	}
}

/// Resolves on the first termination signal. The gateway's drain (bounded by
/// the grace period) handles everything after that, so there is no second
/// chance or forced-exit escalation here.
async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		let mut term = match signal(SignalKind::terminate()) {
			Ok(term) => term,
			Err(e) => {
				tracing::error!("failed to install SIGTERM handler: {e}");
				// Ctrl+C alone still works.
				let _ = tokio::signal::ctrl_c().await;
				return;
			},
		};
		tokio::select! {
			_ = tokio::signal::ctrl_c() => info!("received SIGINT, draining"),
			_ = term.recv() => info!("received SIGTERM, draining"),
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
		info!("received interrupt, draining");
	}
}
