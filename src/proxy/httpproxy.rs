use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body::SizeHint;
use hyper::body::Incoming;
use pin_project_lite::pin_project;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthPipeline, Decision, RequestContext};
use crate::config::Config;
use crate::http::cors::Cors;
use crate::http::{
	Body, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, WellKnownContentTypes,
	classify_content_type, header, sensitive_headers, x_headers,
};
use crate::llm::{self, LLMRequestInfo, Usage};
use crate::loadbalance::LoadBalancer;
use crate::mtrcs::Metrics;
use crate::parse::sse::{JsonTailDecoder, SseDecoder};
use crate::parse::{passthrough, sse::SseFrame};
use crate::proxy::{ProxyError, UpstreamClient};
use crate::ratelimit::{Allowance, RateLimitError, RateLimiter};
use crate::router::{self, select_rule};
use crate::serdes::mask_key;
use crate::usage::{UsageRecord, UsageReporter};

/// Everything a request needs, shared across connections.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub auth: Arc<AuthPipeline>,
	pub limiter: Option<Arc<RateLimiter>>,
	pub lb: LoadBalancer,
	pub upstream: UpstreamClient,
	pub reporter: Arc<UsageReporter>,
	pub metrics: Arc<Metrics>,
	pub cors: Option<Cors>,
}

/// Client-closed-connection status, for usage records of cancelled streams.
const STATUS_CLIENT_CLOSED: u16 = 499;

#[derive(Clone)]
pub struct HTTPProxy {
	pub inputs: Arc<ProxyInputs>,
}

impl HTTPProxy {
	pub async fn proxy(
		&self,
		req: ::http::Request<Incoming>,
		peer: SocketAddr,
	) -> Response {
		let mut req = req.map(Body::new);
		match self.proxy_internal(&mut req, peer).await {
			Ok(resp) => resp,
			Err(err) => {
				debug!("request rejected: {err}");
				err.into_response()
			},
		}
	}

	async fn proxy_internal(
		&self,
		req: &mut Request,
		peer: SocketAddr,
	) -> Result<Response, ProxyError> {
		let inputs = &self.inputs;
		inputs.metrics.requests.inc();

		// Local endpoints sit in front of the whole pipeline.
		if req.method() == Method::GET && req.uri().path() == "/health" {
			return Ok(plain_response(StatusCode::OK, "OK"));
		}
		if req.method() == Method::GET && req.uri().path() == "/metrics" {
			return Ok(plain_response(StatusCode::OK, inputs.metrics.encode()));
		}

		sensitive_headers(req);

		// CORS front-door: preflights are answered here, actual requests
		// collect headers for the eventual response.
		let cors_headers = match &inputs.cors {
			Some(cors) => {
				let res = cors.apply(req).map_err(ProxyError::Internal)?;
				if let Some(direct) = res.direct_response {
					return Ok(direct);
				}
				res.response_headers
			},
			None => None,
		};

		let api_key = auth::extract_api_key(req.headers(), inputs.auth.header_names());
		let client_ip = auth::extract_client_ip(req.headers(), peer);

		// Admission: global bucket, then the per-key bucket and concurrency
		// cap. 429s carry Retry-After and the limit headers.
		let allowance = match &inputs.limiter {
			Some(limiter) => match limiter.check(api_key.as_deref()).await {
				Ok(allowance) => allowance,
				Err(RateLimitError::Exceeded { limit, remaining }) => {
					inputs.metrics.rate_limited.inc();
					return Err(ProxyError::RateLimitExceeded {
						limit: Some(limit),
						remaining: Some(remaining),
					});
				},
				Err(RateLimitError::TooManyConcurrent { limit }) => {
					inputs.metrics.rate_limited.inc();
					return Err(ProxyError::TooManyConcurrent { limit });
				},
				Err(RateLimitError::Store(e)) => return Err(ProxyError::Internal(e)),
			},
			None => Allowance::default(),
		};

		let result = self
			.authed_request(req, api_key, client_ip, &allowance, cors_headers)
			.await;
		if result.is_err() {
			// The drop-guard only exists once proxying began; on the error
			// path the slot is released here.
			if let Some(limiter) = &inputs.limiter {
				limiter.release(&allowance).await;
			}
		}
		result
	}

	async fn authed_request(
		&self,
		req: &mut Request,
		api_key: Option<String>,
		client_ip: std::net::IpAddr,
		allowance: &Allowance,
		cors_headers: Option<HeaderMap>,
	) -> Result<Response, ProxyError> {
		let inputs = &self.inputs;
		let method = req.method().clone();
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());
		let path = req.uri().path().to_string();

		// The payload is opaque, but scripts, fallback routing and usage
		// records all need to see it; buffer once, bounded.
		let body_bytes = buffer_body(req, inputs.cfg.body_limit).await?;
		let (body_json, request_info) = llm::inspect_request(&body_bytes);

		let ctx = RequestContext {
			api_key: api_key.clone(),
			client_ip,
			method: method.as_str().to_string(),
			path: path.clone(),
			body: body_json.clone(),
		};
		let decision = inputs.auth.run(&ctx).await;
		if !decision.allow {
			inputs.metrics.auth_rejected.inc();
			return Err(ProxyError::AuthDenied {
				reason: decision
					.reason
					.unwrap_or_else(|| "denied by policy".to_string()),
				status: decision.status,
			});
		}

		self
			.forward(
				req.headers().clone(),
				method,
				path,
				path_and_query,
				body_bytes,
				body_json,
				request_info,
				decision,
				client_ip,
				api_key,
				allowance,
				cors_headers,
			)
			.await
	}

	#[allow(clippy::too_many_arguments)]
	async fn forward(
		&self,
		mut headers: HeaderMap,
		method: Method,
		path: String,
		path_and_query: String,
		body_bytes: Bytes,
		body_json: serde_json::Value,
		request_info: LLMRequestInfo,
		decision: Decision,
		client_ip: std::net::IpAddr,
		api_key: Option<String>,
		allowance: &Allowance,
		cors_headers: Option<HeaderMap>,
	) -> Result<Response, ProxyError> {
		let inputs = &self.inputs;
		let start = Instant::now();
		let timestamp = Utc::now();
		let request_id = uuid::Uuid::new_v4().to_string();
		append_forwarded_for(&mut headers, client_ip);

		// Routing: an explicit fallback rule wins; otherwise one backend
		// from the balancer, pinned to the snapshot this request started
		// under.
		let model = request_info.model.as_deref();
		let targets = match select_rule(&inputs.cfg.routes, model) {
			Some(rule) => rule
				.targets()
				.map(|t| t.strip_suffix('/').unwrap_or(t).to_string())
				.collect::<Vec<String>>(),
			None => {
				let snapshot = inputs.lb.snapshot();
				let backend = inputs
					.lb
					.balancer
					.next(&snapshot)
					.ok_or(ProxyError::NoHealthyBackends)?;
				vec![backend.normalized_url().to_string()]
			},
		};

		let outcome = self
			.run_ladder(&targets, &method, &path_and_query, &headers, &body_bytes)
			.await;

		let pending = Pending {
			request_id: request_id.clone(),
			timestamp,
			start,
			api_key_masked: api_key.as_deref().map(mask_key).unwrap_or_default(),
			api_key,
			concurrency_key: allowance.concurrency_key.clone(),
			user_id: decision
				.credential
				.as_ref()
				.map(|c| c.user_id.clone())
				.unwrap_or_default(),
			provider: decision.provider.clone(),
			method: method.as_str().to_string(),
			path,
			backend_url: String::new(),
			status: 0,
			is_stream: request_info.stream,
			request_body: body_json,
			usage: Arc::new(Mutex::new(None)),
		};

		let (mut resp, backend_url) = match outcome {
			Ok(ok) => ok,
			Err((err, last_target)) => {
				// Proxying began, so the request is accounted even though the
				// ladder never produced a response.
				let mut pending = pending;
				pending.backend_url = last_target;
				pending.status = match &err {
					ProxyError::RequestTimeout => 504,
					ProxyError::NoHealthyBackends => 503,
					_ => 502,
				};
				finalize(inputs.clone(), pending, None);
				return Err(err);
			},
		};

		// Tap the response for the usage tail without re-framing bytes.
		let usage_cell = pending.usage.clone();
		let body = std::mem::replace(resp.body_mut(), Body::empty());
		let observed = match classify_content_type(resp.headers()) {
			WellKnownContentTypes::Sse => {
				passthrough::parser(body, SseDecoder::new(inputs.cfg.body_limit), move |frame: SseFrame| {
					if let Some(usage) = llm::usage_from_sse_data(&frame.data) {
						*usage_cell.lock().expect("poisoned") = Some(usage);
					}
				})
			},
			_ => passthrough::parser(
				body,
				JsonTailDecoder::new(inputs.cfg.body_limit),
				move |tail: Bytes| {
					if let Some(usage) = llm::usage_from_body(&tail) {
						*usage_cell.lock().expect("poisoned") = Some(usage);
					}
				},
			),
		};

		let mut pending = pending;
		pending.backend_url = backend_url;
		pending.status = resp.status().as_u16();
		let guard = FinishGuard {
			inputs: inputs.clone(),
			pending: Some(pending),
		};
		*resp.body_mut() = Body::new(FinishBody {
			body: observed,
			guard,
			eos: false,
		});

		decorate_response(&mut resp, &request_id, allowance, cors_headers);
		Ok(resp)
	}

	/// Primary (with retry) then each fallback (each with retry). Returns
	/// the successful (or final observed) response and the target that
	/// produced it, or the last error and the last target tried.
	async fn run_ladder(
		&self,
		targets: &[String],
		method: &Method,
		path_and_query: &str,
		headers: &HeaderMap,
		body: &Bytes,
	) -> Result<(Response, String), (ProxyError, String)> {
		let inputs = &self.inputs;
		let retry = &inputs.cfg.retry;
		let mut last_resp: Option<(Response, String)> = None;
		let mut last_err: Option<ProxyError> = None;

		for (ti, target) in targets.iter().enumerate() {
			let last_target = ti == targets.len() - 1;
			// The retry counter is per backend; switching to a fallback
			// starts over.
			for attempt in 0..=retry.max_retries {
				if attempt > 0 {
					inputs.metrics.upstream_retries.inc();
					tokio::time::sleep(retry.backoff(attempt)).await;
				}
				let attempt_start = Instant::now();
				let result = inputs
					.upstream
					.send(target, method, path_and_query, headers, body.clone())
					.await;
				let last_attempt = last_target && attempt == retry.max_retries;
				match result {
					Ok(resp) => {
						let status = resp.status();
						if !router::retryable_status(status) {
							inputs.lb.balancer.record_result(
								target,
								attempt_start.elapsed(),
								!status.is_server_error(),
							);
							return Ok((resp, target.clone()));
						}
						debug!(%target, %status, attempt, "retriable upstream status");
						last_resp = Some((resp, target.clone()));
						last_err = None;
						if last_attempt {
							break;
						}
					},
					Err(e) if e.is_retryable() => {
						debug!(%target, attempt, "retriable upstream error: {e}");
						last_err = Some(e);
						if last_attempt {
							break;
						}
					},
					Err(e) => {
						inputs
							.lb
							.balancer
							.record_result(target, attempt_start.elapsed(), false);
						return Err((e, target.clone()));
					},
				}
			}
			inputs
				.lb
				.balancer
				.record_result(target, Default::default(), false);
		}

		// Exhausted: relay the last observed status, else 502.
		if let Some((resp, target)) = last_resp {
			return Ok((resp, target));
		}
		let target = targets.last().cloned().unwrap_or_default();
		Err((
			last_err.unwrap_or(ProxyError::NoHealthyBackends),
			target,
		))
	}
}

async fn buffer_body(req: &mut Request, limit: usize) -> Result<Bytes, ProxyError> {
	let body = std::mem::replace(req.body_mut(), Body::empty());
	axum::body::to_bytes(body, limit)
		.await
		.map_err(|_| ProxyError::BodyTooLarge)
}

fn plain_response(status: StatusCode, body: impl Into<String>) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(body.into()))
		.expect("builder with known status cannot fail")
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: std::net::IpAddr) {
	let prior = headers
		.get(&x_headers::X_FORWARDED_FOR)
		.and_then(|v| v.to_str().ok());
	let value = match prior {
		Some(list) => format!("{list}, {client_ip}"),
		None => client_ip.to_string(),
	};
	if let Ok(hv) = HeaderValue::try_from(value) {
		headers.insert(x_headers::X_FORWARDED_FOR.clone(), hv);
	}
}

fn decorate_response(
	resp: &mut Response,
	request_id: &str,
	allowance: &Allowance,
	cors_headers: Option<HeaderMap>,
) {
	if let Ok(hv) = HeaderValue::try_from(request_id) {
		resp.headers_mut().insert(x_headers::X_REQUEST_ID.clone(), hv);
	}
	if let Some(limit) = allowance.limit {
		if let Ok(hv) = HeaderValue::try_from(limit.to_string()) {
			resp
				.headers_mut()
				.insert(x_headers::X_RATELIMIT_LIMIT.clone(), hv);
		}
	}
	if let Some(remaining) = allowance.remaining {
		if let Ok(hv) = HeaderValue::try_from(remaining.to_string()) {
			resp
				.headers_mut()
				.insert(x_headers::X_RATELIMIT_REMAINING.clone(), hv);
		}
	}
	if let Some(extra) = cors_headers {
		for (k, v) in extra.iter() {
			resp.headers_mut().insert(k.clone(), v.clone());
		}
	}
}

/// Accounting state carried until the response body completes.
struct Pending {
	request_id: String,
	timestamp: DateTime<Utc>,
	start: Instant,
	api_key: Option<String>,
	concurrency_key: Option<String>,
	api_key_masked: String,
	user_id: String,
	provider: Option<String>,
	method: String,
	path: String,
	backend_url: String,
	status: u16,
	is_stream: bool,
	request_body: serde_json::Value,
	usage: Arc<Mutex<Option<Usage>>>,
}

/// Assemble and dispatch the usage record, release the concurrency slot and
/// write the quota delta back. Never blocks the response path: delivery is
/// queued, the async tail runs on its own task.
fn finalize(inputs: Arc<ProxyInputs>, pending: Pending, override_status: Option<u16>) {
	let usage = pending
		.usage
		.lock()
		.expect("poisoned")
		.take()
		.unwrap_or_default();
	let status = override_status.unwrap_or(pending.status);
	let record = UsageRecord {
		request_id: pending.request_id,
		timestamp: pending.timestamp,
		api_key: pending.api_key_masked,
		user_id: pending.user_id,
		method: pending.method,
		path: pending.path,
		backend_url: pending.backend_url,
		status_code: status,
		latency_ms: pending.start.elapsed().as_millis() as u64,
		prompt_tokens: usage.prompt_tokens,
		completion_tokens: usage.completion_tokens,
		total_tokens: usage.total_tokens,
		request_body: pending.request_body,
		is_stream: pending.is_stream,
	};
	info!(
		request_id = %record.request_id,
		method = %record.method,
		path = %record.path,
		backend = %record.backend_url,
		status = record.status_code,
		latency_ms = record.latency_ms,
		tokens = record.total_tokens,
		key = %record.api_key,
		"request completed"
	);
	inputs.reporter.enqueue(record);

	let provider = pending.provider;
	let api_key = pending.api_key;
	let tokens = usage.total_tokens;
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		handle.spawn(async move {
			if let (Some(provider), Some(key)) = (provider, api_key) {
				inputs.auth.deduct(&provider, &key, tokens).await;
			}
		});
	}
}

struct FinishGuard {
	inputs: Arc<ProxyInputs>,
	pending: Option<Pending>,
}

impl FinishGuard {
	fn finish(&mut self, cancelled: bool) {
		let Some(pending) = self.pending.take() else {
			return;
		};
		let inputs = self.inputs.clone();
		// Concurrency slots release on every completion path, including
		// client cancellation.
		if let (Some(limiter), Some(key)) = (inputs.limiter.clone(), pending.concurrency_key.clone())
		{
			if let Ok(handle) = tokio::runtime::Handle::try_current() {
				handle.spawn(async move {
					let allowance = Allowance {
						concurrency_key: Some(key),
						..Default::default()
					};
					limiter.release(&allowance).await;
				});
			}
		}
		if cancelled {
			warn!(request_id = %pending.request_id, "client closed connection mid-response");
		}
		finalize(
			self.inputs.clone(),
			pending,
			cancelled.then_some(STATUS_CLIENT_CLOSED),
		);
	}
}

impl Drop for FinishGuard {
	fn drop(&mut self) {
		// Reaching Drop with state still pending means the body never hit
		// end-of-stream: the client went away.
		self.finish(true);
	}
}

pin_project! {
	/// Finalizes accounting exactly once: at end-of-stream, or from Drop
	/// when the client disconnects mid-response (which also aborts the
	/// upstream body it wraps).
	struct FinishBody {
		#[pin]
		body: Body,
		guard: FinishGuard,
		eos: bool,
	}
}

impl http_body::Body for FinishBody {
	type Data = Bytes;
	type Error = crate::http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let result = ready!(this.body.poll_frame(cx));
		match result {
			None => {
				*this.eos = true;
				this.guard.finish(false);
				Poll::Ready(None)
			},
			Some(Err(e)) => {
				*this.eos = true;
				this.guard.finish(false);
				Poll::Ready(Some(Err(e)))
			},
			frame => Poll::Ready(frame),
		}
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}
