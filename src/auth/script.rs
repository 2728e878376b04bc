use std::time::{Duration, SystemTime, UNIX_EPOCH};

use boa_engine::property::Attribute;
use boa_engine::{Context, JsResult, JsString, JsValue, NativeFunction, Source, js_string};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

/// A provider decision script. Scripts are JavaScript, must define
/// `function check(request, key_info, standard_checks)` and return
/// `{allow, reason?, statusCode?}` or null. The source is validated at
/// startup; invocation builds a fresh sandboxed context every time.
#[derive(Debug, Clone)]
pub struct DecisionScript {
	provider: String,
	source: String,
}

/// Tagged outcome of one script invocation. Nil, errors, and deadline
/// breaches all collapse to `Defer`, which hands the decision back to the
/// standard checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptDecision {
	Allow,
	Deny {
		reason: Option<String>,
		code: Option<u16>,
	},
	Defer,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDecision {
	allow: bool,
	#[serde(default)]
	reason: Option<String>,
	#[serde(default)]
	status_code: Option<u16>,
}

/// Bounds on a single invocation beyond the wall-clock deadline. The
/// interpreter aborts scripts that exceed these even if the deadline task
/// cannot preempt them. The engine offers no direct heap cap; the stack
/// bound plus the loop/recursion limits and the bounded inputs (request
/// bodies are already capped upstream) stand in for the memory ceiling.
const LOOP_ITERATION_LIMIT: u64 = 2_000_000;
const RECURSION_LIMIT: usize = 256;
const STACK_SIZE_LIMIT: usize = 64 * 1024;

impl DecisionScript {
	/// Parse the script once at startup. A script that fails here prevents
	/// process start.
	pub fn compile(provider: &str, source: &str) -> anyhow::Result<DecisionScript> {
		let script = DecisionScript {
			provider: provider.to_string(),
			source: source.to_string(),
		};
		let mut context = sandbox_context();
		context
			.eval(Source::from_bytes(script.source.as_bytes()))
			.map_err(|e| anyhow::anyhow!("script for provider {provider:?} failed to parse: {e}"))?;
		Ok(script)
	}

	/// Run the script under the configured deadline. The evaluation happens
	/// on a blocking thread; if the deadline fires first the result is
	/// discarded and the decision is `Defer`.
	pub async fn evaluate(
		&self,
		request: serde_json::Value,
		key_info: serde_json::Value,
		standard_checks: serde_json::Value,
		deadline: Duration,
	) -> ScriptDecision {
		let source = self.source.clone();
		let provider = self.provider.clone();
		let task = tokio::task::spawn_blocking(move || {
			evaluate_blocking(&source, request, key_info, standard_checks)
		});
		match tokio::time::timeout(deadline, task).await {
			Ok(Ok(Ok(decision))) => decision,
			Ok(Ok(Err(e))) => {
				warn!(provider = %provider, "decision script failed: {e}");
				ScriptDecision::Defer
			},
			Ok(Err(join)) => {
				warn!(provider = %provider, "decision script panicked: {join}");
				ScriptDecision::Defer
			},
			Err(_) => {
				warn!(provider = %provider, "decision script exceeded deadline");
				ScriptDecision::Defer
			},
		}
	}
}

fn sandbox_context() -> Context {
	let mut context = Context::default();
	// No module loader and no host hooks are installed, so scripts cannot
	// reach the filesystem or spawn anything; these limits bound runaway
	// computation.
	context
		.runtime_limits_mut()
		.set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
	context
		.runtime_limits_mut()
		.set_recursion_limit(RECURSION_LIMIT);
	context
		.runtime_limits_mut()
		.set_stack_size_limit(STACK_SIZE_LIMIT);
	context
}

fn evaluate_blocking(
	source: &str,
	request: serde_json::Value,
	key_info: serde_json::Value,
	standard_checks: serde_json::Value,
) -> anyhow::Result<ScriptDecision> {
	let mut context = sandbox_context();

	for (name, value) in [
		("request", request),
		("key_info", key_info),
		("standard_checks", standard_checks),
	] {
		let js = JsValue::from_json(&value, &mut context)
			.map_err(|e| anyhow::anyhow!("building global {name}: {e}"))?;
		context
			.register_global_property(JsString::from(name), js, Attribute::READONLY)
			.map_err(|e| anyhow::anyhow!("registering global {name}: {e}"))?;
	}
	context
		.register_global_callable(js_string!("log"), 1, NativeFunction::from_fn_ptr(js_log))
		.map_err(|e| anyhow::anyhow!("registering log: {e}"))?;
	context
		.register_global_callable(
			js_string!("sha256"),
			1,
			NativeFunction::from_fn_ptr(js_sha256),
		)
		.map_err(|e| anyhow::anyhow!("registering sha256: {e}"))?;
	context
		.register_global_callable(
			js_string!("now_ms"),
			0,
			NativeFunction::from_fn_ptr(js_now_ms),
		)
		.map_err(|e| anyhow::anyhow!("registering now_ms: {e}"))?;

	context
		.eval(Source::from_bytes(source.as_bytes()))
		.map_err(|e| anyhow::anyhow!("evaluating script: {e}"))?;

	// The wrapper normalizes the result to a JSON string: either "null" or
	// the decision object.
	const WRAPPER: &str = "JSON.stringify((typeof check === 'function') \
		? (check(request, key_info, standard_checks) ?? null) : null)";
	let result = context
		.eval(Source::from_bytes(WRAPPER.as_bytes()))
		.map_err(|e| anyhow::anyhow!("invoking check(): {e}"))?;
	let Some(json) = result.as_string() else {
		return Ok(ScriptDecision::Defer);
	};
	let json = json.to_std_string_escaped();
	if json == "null" {
		return Ok(ScriptDecision::Defer);
	}
	let wire: WireDecision = serde_json::from_str(&json)
		.map_err(|e| anyhow::anyhow!("script returned a malformed decision: {e}"))?;
	Ok(if wire.allow {
		ScriptDecision::Allow
	} else {
		ScriptDecision::Deny {
			reason: wire.reason,
			code: wire.status_code,
		}
	})
}

fn js_log(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
	let msg = args
		.first()
		.map(|v| v.display().to_string())
		.unwrap_or_default();
	tracing::info!(target: "decision_script", "{msg}");
	Ok(JsValue::undefined())
}

fn js_sha256(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
	let input = match args.first() {
		Some(v) => v.to_string(ctx)?.to_std_string_escaped(),
		None => String::new(),
	};
	let digest = Sha256::digest(input.as_bytes());
	let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
	Ok(JsValue::from(JsString::from(hex)))
}

fn js_now_ms(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
	let ms = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as f64;
	Ok(JsValue::from(ms))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn checks() -> serde_json::Value {
		serde_json::json!({"status_ok": true, "not_expired": true, "ip_allowed": true, "quota_ok": true})
	}

	#[tokio::test]
	async fn deny_with_reason_and_code() {
		let script = DecisionScript::compile(
			"file",
			r#"
			function check(request, key_info, standard_checks) {
				if (request.body.viplevel < 3) {
					return {allow: false, reason: "viplevel too low", statusCode: 403};
				}
				return null;
			}
			"#,
		)
		.unwrap();
		let request = serde_json::json!({"method": "POST", "path": "/v1/chat/completions", "body": {"viplevel": 1}});
		let decision = script
			.evaluate(request, serde_json::json!({}), checks(), Duration::from_millis(100))
			.await;
		assert_eq!(
			decision,
			ScriptDecision::Deny {
				reason: Some("viplevel too low".to_string()),
				code: Some(403),
			}
		);
	}

	#[tokio::test]
	async fn null_defers_to_standard_checks() {
		let script =
			DecisionScript::compile("file", "function check() { return null; }").unwrap();
		let decision = script
			.evaluate(
				serde_json::json!({}),
				serde_json::json!({}),
				checks(),
				Duration::from_millis(100),
			)
			.await;
		assert_eq!(decision, ScriptDecision::Defer);
	}

	#[tokio::test]
	async fn allow_reads_key_info() {
		let script = DecisionScript::compile(
			"file",
			"function check(request, key_info) { return {allow: key_info.user_id === 'u1'}; }",
		)
		.unwrap();
		let decision = script
			.evaluate(
				serde_json::json!({}),
				serde_json::json!({"user_id": "u1"}),
				checks(),
				Duration::from_millis(100),
			)
			.await;
		assert_eq!(decision, ScriptDecision::Allow);
	}

	#[tokio::test]
	async fn infinite_loop_is_aborted_within_deadline() {
		let script =
			DecisionScript::compile("file", "function check() { while (true) {} }").unwrap();
		let start = std::time::Instant::now();
		let decision = script
			.evaluate(
				serde_json::json!({}),
				serde_json::json!({}),
				checks(),
				Duration::from_millis(100),
			)
			.await;
		assert_eq!(decision, ScriptDecision::Defer);
		// The await returns at the deadline even if the interpreter is still
		// grinding toward its iteration limit.
		assert!(start.elapsed() < Duration::from_secs(2));
	}

	#[test]
	fn parse_failure_is_fatal() {
		assert!(DecisionScript::compile("file", "function check( {").is_err());
	}

	#[tokio::test]
	async fn helpers_are_available() {
		let script = DecisionScript::compile(
			"file",
			r#"
			function check(request) {
				log("checking " + request.path);
				var h = sha256("abc");
				return {allow: h === "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad" && now_ms() > 0};
			}
			"#,
		)
		.unwrap();
		let decision = script
			.evaluate(
				serde_json::json!({"path": "/x"}),
				serde_json::json!({}),
				checks(),
				Duration::from_millis(500),
			)
			.await;
		assert_eq!(decision, ScriptDecision::Allow);
	}
}
