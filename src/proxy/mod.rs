mod gateway;
pub mod httpproxy;
mod upstream;

pub use gateway::Gateway;
use serde::{Deserialize, Serialize};
pub use upstream::UpstreamClient;

use crate::http::{Body, HeaderValue, Response, StatusCode, header, x_headers};

/// Stable machine-readable error types carried in the envelope.
pub mod error_type {
	pub const RATE_LIMITED: &str = "RATE_LIMITED";
	pub const UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
	pub const AUTH_DENIED: &str = "AUTH_DENIED";
	pub const QUOTA_EXHAUSTED: &str = "QUOTA_EXHAUSTED";
	pub const BAD_REQUEST: &str = "BAD_REQUEST";
	pub const INTERNAL: &str = "INTERNAL";
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("no healthy backends")]
	NoHealthyBackends,
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(String),
	#[error("request timeout")]
	RequestTimeout,
	#[error("rate limit exceeded")]
	RateLimitExceeded {
		limit: Option<u64>,
		remaining: Option<u64>,
	},
	#[error("too many concurrent requests")]
	TooManyConcurrent { limit: u64 },
	#[error("{reason}")]
	AuthDenied { reason: String, status: u16 },
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("request body too large")]
	BodyTooLarge,
	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

impl ProxyError {
	/// Network-layer failures and timeouts retry; everything else is final.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			ProxyError::UpstreamCallFailed(_) | ProxyError::RequestTimeout
		)
	}

	fn status(&self) -> StatusCode {
		match self {
			ProxyError::NoHealthyBackends => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::UpstreamCallFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::TooManyConcurrent { .. } => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::AuthDenied { status, .. } => {
				StatusCode::from_u16(*status).unwrap_or(StatusCode::FORBIDDEN)
			},
			ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn error_type(&self) -> &'static str {
		match self {
			ProxyError::NoHealthyBackends
			| ProxyError::UpstreamCallFailed(_)
			| ProxyError::RequestTimeout => error_type::UPSTREAM_UNAVAILABLE,
			ProxyError::RateLimitExceeded { .. } | ProxyError::TooManyConcurrent { .. } => {
				error_type::RATE_LIMITED
			},
			ProxyError::AuthDenied { status, .. } => {
				if *status == 429 {
					error_type::QUOTA_EXHAUSTED
				} else {
					error_type::AUTH_DENIED
				}
			},
			ProxyError::InvalidRequest(_) | ProxyError::BodyTooLarge => error_type::BAD_REQUEST,
			ProxyError::Internal(_) => error_type::INTERNAL,
		}
	}

	/// Every proxy-originated failure renders as the documented envelope.
	pub fn into_response(self) -> Response {
		let status = self.status();
		let envelope = ErrorEnvelope {
			error: ErrorBody {
				message: self.to_string(),
				code: status.as_u16(),
				r#type: Some(self.error_type().to_string()),
			},
		};
		let mut rb = ::http::Response::builder()
			.status(status)
			.header(header::CONTENT_TYPE, "application/json");
		if let ProxyError::RateLimitExceeded { limit, remaining } = &self {
			rb = rb.header(header::RETRY_AFTER, HeaderValue::from_static("1"));
			if let Some(l) = limit {
				if let Ok(hv) = HeaderValue::try_from(l.to_string()) {
					rb = rb.header(x_headers::X_RATELIMIT_LIMIT, hv);
				}
			}
			if let Some(r) = remaining {
				if let Ok(hv) = HeaderValue::try_from(r.to_string()) {
					rb = rb.header(x_headers::X_RATELIMIT_REMAINING, hv);
				}
			}
		}
		if let ProxyError::TooManyConcurrent { limit } = &self {
			rb = rb.header(header::RETRY_AFTER, HeaderValue::from_static("1"));
			if let Ok(hv) = HeaderValue::try_from(limit.to_string()) {
				rb = rb.header(x_headers::X_RATELIMIT_LIMIT, hv);
			}
		}
		let body = serde_json::to_vec(&envelope).expect("envelope serialization cannot fail");
		rb.body(Body::from(body))
			.expect("builder with known status cannot fail")
	}
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
	pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
	pub message: String,
	pub code: u16,
	#[serde(rename = "type", skip_serializing_if = "Option::is_none")]
	pub r#type: Option<String>,
}

#[cfg(test)]
mod tests {
	use axum::body::to_bytes;

	use super::*;

	async fn envelope_of(err: ProxyError) -> (StatusCode, ErrorEnvelope) {
		let resp = err.into_response();
		let status = resp.status();
		let bytes = to_bytes(resp.into_body(), 1 << 16).await.unwrap();
		(status, serde_json::from_slice(&bytes).unwrap())
	}

	#[tokio::test]
	async fn every_error_renders_the_documented_shape() {
		for err in [
			ProxyError::NoHealthyBackends,
			ProxyError::UpstreamCallFailed("connection refused".to_string()),
			ProxyError::RequestTimeout,
			ProxyError::RateLimitExceeded {
				limit: Some(5),
				remaining: Some(0),
			},
			ProxyError::TooManyConcurrent { limit: 2 },
			ProxyError::AuthDenied {
				reason: "nope".to_string(),
				status: 403,
			},
			ProxyError::InvalidRequest("bad".to_string()),
			ProxyError::BodyTooLarge,
			ProxyError::Internal(anyhow::anyhow!("boom")),
		] {
			let (status, envelope) = envelope_of(err).await;
			assert_eq!(envelope.error.code, status.as_u16());
			assert!(!envelope.error.message.is_empty());
			assert!(envelope.error.r#type.is_some());
		}
	}

	#[tokio::test]
	async fn rate_limit_rejection_carries_headers() {
		let resp = ProxyError::RateLimitExceeded {
			limit: Some(5),
			remaining: Some(0),
		}
		.into_response();
		assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
		assert_eq!(resp.headers().get(&x_headers::X_RATELIMIT_LIMIT).unwrap(), "5");
		assert_eq!(
			resp.headers().get(&x_headers::X_RATELIMIT_REMAINING).unwrap(),
			"0"
		);
	}

	#[tokio::test]
	async fn quota_exhaustion_maps_to_its_own_type() {
		let (_, envelope) = envelope_of(ProxyError::AuthDenied {
			reason: "quota exhausted".to_string(),
			status: 429,
		})
		.await;
		assert_eq!(
			envelope.error.r#type.as_deref(),
			Some(error_type::QUOTA_EXHAUSTED)
		);
	}
}
