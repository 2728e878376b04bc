use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Token counts reported by an upstream. Absent counts are zeros; the proxy
/// never tokenizes locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
	#[serde(default)]
	pub prompt_tokens: u64,
	#[serde(default)]
	pub completion_tokens: u64,
	#[serde(default)]
	pub total_tokens: u64,
}

/// The little the proxy reads out of an otherwise opaque request payload:
/// the model name (for fallback routing) and the streaming flag (for SSE
/// handling). Everything else passes through untouched.
#[derive(Debug, Clone, Default)]
pub struct LLMRequestInfo {
	pub model: Option<String>,
	pub stream: bool,
}

/// Parse the request body. Unparseable bodies are not an error; the request
/// is still proxied, with `Null` standing in for script/usage visibility.
pub fn inspect_request(body: &Bytes) -> (serde_json::Value, LLMRequestInfo) {
	let value: serde_json::Value = match serde_json::from_slice(body) {
		Ok(v) => v,
		Err(_) => serde_json::Value::Null,
	};
	let info = LLMRequestInfo {
		model: value
			.get("model")
			.and_then(|m| m.as_str())
			.map(|s| s.to_string()),
		stream: value
			.get("stream")
			.and_then(|s| s.as_bool())
			.unwrap_or(false),
	};
	(value, info)
}

/// Pull `usage.{prompt_tokens, completion_tokens, total_tokens}` out of a
/// response object (either a completed JSON body or one SSE chunk).
pub fn usage_from_json(value: &serde_json::Value) -> Option<Usage> {
	let usage = value.get("usage")?;
	if usage.is_null() {
		return None;
	}
	serde_json::from_value(usage.clone()).ok()
}

pub fn usage_from_body(body: &[u8]) -> Option<Usage> {
	let value: serde_json::Value = serde_json::from_slice(body).ok()?;
	usage_from_json(&value)
}

/// For SSE streams: the conventional final `usage` event is the last data
/// frame carrying a usage object before `data: [DONE]`. Feed every frame
/// through here and keep the most recent hit.
pub fn usage_from_sse_data(data: &str) -> Option<Usage> {
	if data == "[DONE]" {
		return None;
	}
	usage_from_body(data.as_bytes())
}
