use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::httpproxy::{HTTPProxy, ProxyInputs};

/// Accepts connections and serves the proxy until cancelled, then drains
/// in-flight requests within the configured grace period.
pub struct Gateway {
	listener: TcpListener,
	inputs: Arc<ProxyInputs>,
}

impl Gateway {
	pub async fn bind(addr: SocketAddr, inputs: Arc<ProxyInputs>) -> anyhow::Result<Gateway> {
		let listener = TcpListener::bind(addr).await?;
		info!(addr = %listener.local_addr()?, "listening");
		Ok(Gateway { listener, inputs })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self
			.listener
			.local_addr()
			.expect("bound listener has an address")
	}

	pub async fn run(self, cancel: CancellationToken) {
		let grace = self.inputs.cfg.grace_period;
		let server = auto_server();
		let graceful = GracefulShutdown::new();
		let proxy = HTTPProxy {
			inputs: self.inputs.clone(),
		};

		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				accepted = self.listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(pair) => pair,
						Err(e) => {
							warn!("accept failed: {e}");
							continue;
						},
					};
					debug!(%peer, "connection opened");
					let proxy = proxy.clone();
					let svc = hyper::service::service_fn(move |req| {
						let proxy = proxy.clone();
						async move { Ok::<_, Infallible>(proxy.proxy(req, peer).await) }
					});
					let conn = server
						.serve_connection_with_upgrades(TokioIo::new(stream), svc)
						.into_owned();
					let conn = graceful.watch(conn);
					tokio::spawn(async move {
						if let Err(e) = conn.await {
							debug!(%peer, "connection closed: {e}");
						}
					});
				},
			}
		}

		// Stop accepting, then give in-flight requests the grace period.
		drop(self.listener);
		info!("draining connections");
		tokio::select! {
			_ = graceful.shutdown() => info!("connections drained"),
			_ = tokio::time::sleep(grace) => warn!("grace period expired, aborting remaining connections"),
		}
	}
}

pub fn auto_server() -> auto::Builder<hyper_util::rt::TokioExecutor> {
	let mut b = auto::Builder::new(hyper_util::rt::TokioExecutor::new());
	b.http2().timer(hyper_util::rt::tokio::TokioTimer::new());
	b
}
