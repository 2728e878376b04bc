use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use llmproxy::proxy::ErrorEnvelope;
use llmproxy::{app, config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn start(config_yaml: &str) -> app::Bound {
	let cfg = config::parse_config(config_yaml).expect("test config parses");
	app::run(Arc::new(cfg)).await.expect("proxy starts")
}

fn base_config(backend_url: &str) -> String {
	format!(
		r#"
listen: 127.0.0.1:0
gracePeriod: 1s
discovery:
  interval: 60s
  sources:
    - kind: static
      backends:
        - name: b1
          url: {backend_url}
loadBalance:
  probeInterval: 60s
auth:
  providers:
    - kind: file
      name: keys
      keys:
        - key: sk-test
          userId: u1
          quota: 100000
"#
	)
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
	let backend = MockServer::start().await;
	let bound = start(&base_config(&backend.uri())).await;
	let base = format!("http://{}", bound.local_addr);

	let resp = reqwest::get(format!("{base}/health")).await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "OK");

	let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
	assert_eq!(resp.status(), 200);
	let text = resp.text().await.unwrap();
	assert!(text.contains("llmproxy_requests_total"));

	bound.stop().await.unwrap();
}

#[tokio::test]
async fn proxies_completions_and_reports_usage() {
	let backend = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"id": "cmpl-1",
			"choices": [{"message": {"role": "assistant", "content": "hi"}}],
			"usage": {"prompt_tokens": 7, "completion_tokens": 5, "total_tokens": 12}
		})))
		.expect(1)
		.mount(&backend)
		.await;
	let collector = MockServer::start().await;
	Mock::given(method("POST"))
		.and(body_partial_json(serde_json::json!({
			"user_id": "u1",
			"status_code": 200,
			"total_tokens": 12,
			"is_stream": false
		})))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&collector)
		.await;

	let cfg = format!(
		"{}usage:\n  sinks:\n    - kind: webhook\n      url: {}\n",
		base_config(&backend.uri()),
		collector.uri()
	);
	let bound = start(&cfg).await;
	let base = format!("http://{}", bound.local_addr);

	let client = reqwest::Client::new();
	let resp = client
		.post(format!("{base}/v1/chat/completions"))
		.bearer_auth("sk-test")
		.json(&serde_json::json!({"model": "m", "messages": []}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	assert!(resp.headers().get("x-request-id").is_some());
	let body: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(body["id"], "cmpl-1");

	// Usage delivery is asynchronous.
	tokio::time::sleep(Duration::from_millis(300)).await;
	backend.verify().await;
	collector.verify().await;

	bound.stop().await.unwrap();
}

#[tokio::test]
async fn streaming_bytes_pass_through_in_order() {
	let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n\
		data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
		data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n\
		data: [DONE]\n\n";
	let backend = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(
			ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes(), "text/event-stream"),
		)
		.mount(&backend)
		.await;
	let collector = MockServer::start().await;
	Mock::given(method("POST"))
		.and(body_partial_json(serde_json::json!({
			"is_stream": true,
			"total_tokens": 5,
			"status_code": 200
		})))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&collector)
		.await;

	let cfg = format!(
		"{}usage:\n  sinks:\n    - kind: webhook\n      url: {}\n",
		base_config(&backend.uri()),
		collector.uri()
	);
	let bound = start(&cfg).await;
	let base = format!("http://{}", bound.local_addr);

	let client = reqwest::Client::new();
	let resp = client
		.post(format!("{base}/v1/chat/completions"))
		.bearer_auth("sk-test")
		.json(&serde_json::json!({"model": "m", "stream": true, "messages": []}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp
			.headers()
			.get("content-type")
			.and_then(|v| v.to_str().ok()),
		Some("text/event-stream")
	);
	// Byte ordering of the streamed response is preserved exactly.
	let body = resp.text().await.unwrap();
	assert_eq!(body, sse_body);

	tokio::time::sleep(Duration::from_millis(300)).await;
	collector.verify().await;

	bound.stop().await.unwrap();
}

#[tokio::test]
async fn auth_script_denial_never_reaches_upstream() {
	let backend = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200))
		.expect(0)
		.mount(&backend)
		.await;

	let script = "function check(request, key_info, standard_checks) { \
		if (request.body.viplevel < 3) { \
			return {allow: false, reason: 'viplevel too low', statusCode: 403}; \
		} \
		return null; }";
	let cfg = format!(
		r#"
listen: 127.0.0.1:0
gracePeriod: 1s
discovery:
  interval: 60s
  sources:
    - kind: static
      backends:
        - name: b1
          url: {}
auth:
  providers:
    - kind: file
      keys:
        - key: sk-test
      script: "{}"
"#,
		backend.uri(),
		script,
	);
	let bound = start(&cfg).await;
	let base = format!("http://{}", bound.local_addr);

	let client = reqwest::Client::new();
	let resp = client
		.post(format!("{base}/v1/chat/completions"))
		.bearer_auth("sk-test")
		.json(&serde_json::json!({"model": "m", "viplevel": 1}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 403);
	let envelope: ErrorEnvelope = resp.json().await.unwrap();
	assert_eq!(envelope.error.message, "viplevel too low");
	assert_eq!(envelope.error.code, 403);

	backend.verify().await;
	bound.stop().await.unwrap();
}

#[tokio::test]
async fn retry_then_fallback_ladder() {
	let primary = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(502))
		// maxRetries: 2 means three attempts against the primary.
		.expect(3)
		.mount(&primary)
		.await;
	let fallback = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
		.expect(1)
		.mount(&fallback)
		.await;

	let cfg = format!(
		r#"
listen: 127.0.0.1:0
gracePeriod: 1s
retry:
  maxRetries: 2
  initialBackoff: 10ms
routes:
  - models: ["gpt-4*"]
    primary: {}
    fallbacks: [{}]
auth:
  providers:
    - kind: file
      keys:
        - key: sk-test
"#,
		primary.uri(),
		fallback.uri(),
	);
	let bound = start(&cfg).await;
	let base = format!("http://{}", bound.local_addr);

	let client = reqwest::Client::new();
	let resp = client
		.post(format!("{base}/v1/chat/completions"))
		.bearer_auth("sk-test")
		.json(&serde_json::json!({"model": "gpt-4o", "messages": []}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);

	primary.verify().await;
	fallback.verify().await;
	bound.stop().await.unwrap();
}

#[tokio::test]
async fn global_rate_limit_rejects_with_headers() {
	let backend = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
		.mount(&backend)
		.await;

	let cfg = format!(
		"{}rateLimit:\n  global:\n    capacity: 5\n    refillPerSec: 1\n",
		base_config(&backend.uri())
	);
	let bound = start(&cfg).await;
	let base = format!("http://{}", bound.local_addr);

	let client = reqwest::Client::new();
	let mut statuses = Vec::new();
	let mut rejected = None;
	for _ in 0..6 {
		let resp = client
			.post(format!("{base}/v1/chat/completions"))
			.bearer_auth("sk-test")
			.json(&serde_json::json!({"model": "m"}))
			.send()
			.await
			.unwrap();
		if resp.status() == 429 {
			rejected = Some((
				resp
					.headers()
					.get("retry-after")
					.and_then(|v| v.to_str().ok())
					.map(str::to_string),
				resp
					.headers()
					.get("x-ratelimit-remaining")
					.and_then(|v| v.to_str().ok())
					.map(str::to_string),
			));
		}
		statuses.push(resp.status().as_u16());
	}
	assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 5);
	assert_eq!(statuses.iter().filter(|s| **s == 429).count(), 1);
	let (retry_after, remaining) = rejected.unwrap();
	assert_eq!(retry_after.as_deref(), Some("1"));
	assert_eq!(remaining.as_deref(), Some("0"));

	bound.stop().await.unwrap();
}

async fn write_chunk(stream: &mut TcpStream, data: &str) -> std::io::Result<()> {
	stream
		.write_all(format!("{:x}\r\n{data}\r\n", data.len()).as_bytes())
		.await?;
	stream.flush().await
}

/// A backend wiremock cannot play: it sends response headers plus one SSE
/// usage event, then keeps the stream open with keepalive comments until its
/// writes fail (i.e. the proxy aborted the connection). Reports when the
/// abort was observed.
async fn never_ending_sse_backend(abort_tx: oneshot::Sender<Instant>) -> SocketAddr {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.unwrap();
		// Consume the request head (and whatever body arrived with it).
		let mut buf = vec![0u8; 8192];
		let mut read = 0;
		loop {
			let n = stream.read(&mut buf[read..]).await.unwrap();
			read += n;
			if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
				break;
			}
		}
		stream
			.write_all(
				b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
			)
			.await
			.unwrap();
		let usage =
			"data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n";
		write_chunk(&mut stream, usage).await.unwrap();
		loop {
			tokio::time::sleep(Duration::from_millis(25)).await;
			if write_chunk(&mut stream, ": keepalive\n\n").await.is_err() {
				let _ = abort_tx.send(Instant::now());
				return;
			}
		}
	});
	addr
}

#[tokio::test]
async fn client_cancel_mid_stream_aborts_upstream_and_records_499() {
	let (abort_tx, abort_rx) = oneshot::channel();
	let backend_addr = never_ending_sse_backend(abort_tx).await;
	let collector = MockServer::start().await;
	Mock::given(method("POST"))
		.and(body_partial_json(serde_json::json!({
			"status_code": 499,
			"is_stream": true,
			"total_tokens": 5
		})))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&collector)
		.await;

	let cfg = format!(
		"{}usage:\n  sinks:\n    - kind: webhook\n      url: {}\n",
		base_config(&format!("http://{backend_addr}")),
		collector.uri()
	);
	let bound = start(&cfg).await;
	let base = format!("http://{}", bound.local_addr);

	let client = reqwest::Client::new();
	let resp = client
		.post(format!("{base}/v1/chat/completions"))
		.bearer_auth("sk-test")
		.json(&serde_json::json!({"model": "m", "stream": true, "messages": []}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);

	// Read the first frame mid-stream, then walk away.
	let mut body = resp.bytes_stream();
	let first = body.next().await.unwrap().unwrap();
	assert!(first.windows(7).any(|w| w == b"\"usage\""));
	let cancelled_at = Instant::now();
	drop(body);

	// The backend must observe the abort promptly.
	let aborted_at = tokio::time::timeout(Duration::from_secs(1), abort_rx)
		.await
		.expect("backend never observed the abort")
		.unwrap();
	assert!(aborted_at.duration_since(cancelled_at) <= Duration::from_secs(1));

	// And the usage record lands with the client-closed status and the
	// tokens observed before the cancel.
	let mut delivered = false;
	for _ in 0..20 {
		tokio::time::sleep(Duration::from_millis(100)).await;
		if !collector.received_requests().await.unwrap_or_default().is_empty() {
			delivered = true;
			break;
		}
	}
	assert!(delivered, "usage record for the cancelled stream never arrived");
	collector.verify().await;

	bound.stop().await.unwrap();
}

#[tokio::test]
async fn missing_key_is_401_envelope() {
	let backend = MockServer::start().await;
	let bound = start(&base_config(&backend.uri())).await;
	let base = format!("http://{}", bound.local_addr);

	let client = reqwest::Client::new();
	let resp = client
		.post(format!("{base}/v1/chat/completions"))
		.json(&serde_json::json!({"model": "m"}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 401);
	let envelope: ErrorEnvelope = resp.json().await.unwrap();
	assert_eq!(envelope.error.code, 401);
	assert_eq!(envelope.error.r#type.as_deref(), Some("AUTH_DENIED"));

	bound.stop().await.unwrap();
}
