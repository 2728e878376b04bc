use std::str::FromStr;
use std::time::Duration;

use ::http::{HeaderValue, Method, StatusCode, header};
use serde::de::Error;

use crate::http::{Body, HeaderMap, HeaderName, Request, Response};
use crate::serdes::serde_dur_option;

/// CORS front-door policy. The method/header lists are validated and joined
/// into header values once, at configuration time; per-request work is a
/// lookup and a handful of inserts.
#[derive(Debug, Clone)]
pub struct Cors {
	allow_credentials: bool,
	allow_origins: AllowedOrigins,
	allow_methods: Option<HeaderValue>,
	allow_headers: Option<HeaderValue>,
	expose_headers: Option<HeaderValue>,
	max_age: Option<HeaderValue>,
}

#[derive(Debug, Clone, Default)]
enum AllowedOrigins {
	#[default]
	None,
	Any,
	Exact(Vec<String>),
}

impl AllowedOrigins {
	fn from_config(origins: Vec<String>) -> AllowedOrigins {
		if origins.iter().any(|o| o == "*") {
			AllowedOrigins::Any
		} else if origins.is_empty() {
			AllowedOrigins::None
		} else {
			AllowedOrigins::Exact(origins)
		}
	}

	fn permits(&self, origin: &HeaderValue) -> bool {
		match self {
			AllowedOrigins::None => false,
			AllowedOrigins::Any => true,
			AllowedOrigins::Exact(origins) => {
				origins.iter().any(|want| want.as_bytes() == origin.as_bytes())
			},
		}
	}
}

/// Validate each entry, then join the originals into one comma-separated
/// header value. A lone `*` short-circuits to the wildcard.
fn joined_header_value<T: FromStr>(values: &[String]) -> anyhow::Result<Option<HeaderValue>>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	if values.is_empty() {
		return Ok(None);
	}
	if values.iter().any(|v| v == "*") {
		return Ok(Some(HeaderValue::from_static("*")));
	}
	for v in values {
		T::from_str(v).map_err(|e| anyhow::anyhow!("invalid cors entry {v:?}: {e}"))?;
	}
	Ok(Some(HeaderValue::from_str(&values.join(","))?))
}

impl<'de> serde::Deserialize<'de> for Cors {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		Cors::try_from(CorsSerde::deserialize(deserializer)?).map_err(D::Error::custom)
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CorsSerde {
	#[serde(default)]
	pub allow_credentials: bool,
	#[serde(default)]
	pub allow_headers: Vec<String>,
	#[serde(default)]
	pub allow_methods: Vec<String>,
	#[serde(default)]
	pub allow_origins: Vec<String>,
	#[serde(default)]
	pub expose_headers: Vec<String>,
	#[serde(default, with = "serde_dur_option")]
	pub max_age: Option<Duration>,
}

impl TryFrom<CorsSerde> for Cors {
	type Error = anyhow::Error;
	fn try_from(value: CorsSerde) -> Result<Self, Self::Error> {
		Ok(Cors {
			allow_credentials: value.allow_credentials,
			allow_headers: joined_header_value::<HeaderName>(&value.allow_headers)?,
			allow_methods: joined_header_value::<Method>(&value.allow_methods)?,
			allow_origins: AllowedOrigins::from_config(value.allow_origins),
			expose_headers: joined_header_value::<HeaderName>(&value.expose_headers)?,
			max_age: value
				.max_age
				.map(|v| HeaderValue::from_str(&v.as_secs().to_string()))
				.transpose()?,
		})
	}
}

#[derive(Debug, Default)]
pub struct CorsResponse {
	pub direct_response: Option<Response>,
	pub response_headers: Option<HeaderMap>,
}

impl Cors {
	/// Apply the CORS policy. Preflight requests from an allowed origin are
	/// answered locally with 204; other requests collect the response headers
	/// to attach once the upstream answers.
	pub fn apply(&self, req: &Request) -> anyhow::Result<CorsResponse> {
		// If no origin, return immediately
		let Some(origin) = req.headers().get(header::ORIGIN) else {
			return Ok(Default::default());
		};
		if !self.allow_origins.permits(origin) {
			// None matching origin, return
			return Ok(Default::default());
		}

		if req.method() == Method::OPTIONS {
			// Handle preflight request
			let mut rb = ::http::Response::builder()
				.status(StatusCode::NO_CONTENT)
				.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
			if let Some(h) = &self.allow_methods {
				rb = rb.header(header::ACCESS_CONTROL_ALLOW_METHODS, h);
			}
			if let Some(h) = &self.allow_headers {
				rb = rb.header(header::ACCESS_CONTROL_ALLOW_HEADERS, h);
			}
			if let Some(h) = &self.max_age {
				rb = rb.header(header::ACCESS_CONTROL_MAX_AGE, h);
			}
			let response = rb.body(Body::empty())?;
			return Ok(CorsResponse {
				direct_response: Some(response),
				response_headers: None,
			});
		}

		let mut response_headers = HeaderMap::with_capacity(3);
		response_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
		if self.allow_credentials {
			response_headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HEADER_VALUE_TRUE);
		}
		if let Some(h) = &self.expose_headers {
			response_headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, h.clone());
		}
		Ok(CorsResponse {
			direct_response: None,
			response_headers: Some(response_headers),
		})
	}
}

const HEADER_VALUE_TRUE: HeaderValue = HeaderValue::from_static("true");

#[cfg(test)]
mod tests {
	use super::*;

	fn policy() -> Cors {
		let raw: CorsSerde = serde_yaml::from_str(
			r#"
allowOrigins: ["https://app.example.com"]
allowMethods: ["GET", "POST"]
allowHeaders: ["authorization", "content-type"]
maxAge: 10m
"#,
		)
		.unwrap();
		Cors::try_from(raw).unwrap()
	}

	fn request(method: Method, origin: Option<&str>) -> Request {
		let mut rb = ::http::Request::builder().method(method).uri("/v1/chat/completions");
		if let Some(o) = origin {
			rb = rb.header(header::ORIGIN, o);
		}
		rb.body(Body::empty()).unwrap()
	}

	#[test]
	fn preflight_is_answered_locally() {
		let res = policy()
			.apply(&request(Method::OPTIONS, Some("https://app.example.com")))
			.unwrap();
		let resp = res.direct_response.expect("expected a direct response");
		assert_eq!(resp.status(), StatusCode::NO_CONTENT);
		assert_eq!(
			resp
				.headers()
				.get(header::ACCESS_CONTROL_ALLOW_METHODS)
				.unwrap(),
			"GET,POST"
		);
		assert_eq!(
			resp.headers().get(header::ACCESS_CONTROL_MAX_AGE).unwrap(),
			"600"
		);
	}

	#[test]
	fn non_matching_origin_passes_through() {
		let res = policy()
			.apply(&request(Method::POST, Some("https://evil.example.com")))
			.unwrap();
		assert!(res.direct_response.is_none());
		assert!(res.response_headers.is_none());
	}

	#[test]
	fn actual_request_collects_headers() {
		let res = policy()
			.apply(&request(Method::POST, Some("https://app.example.com")))
			.unwrap();
		assert!(res.direct_response.is_none());
		let headers = res.response_headers.unwrap();
		assert_eq!(
			headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
			"https://app.example.com"
		);
	}

	#[test]
	fn wildcard_origin_and_lists() {
		let raw: CorsSerde = serde_yaml::from_str(
			"allowOrigins: ['*']\nallowMethods: ['*']\n",
		)
		.unwrap();
		let cors = Cors::try_from(raw).unwrap();
		let res = cors
			.apply(&request(Method::OPTIONS, Some("https://anywhere.example")))
			.unwrap();
		let resp = res.direct_response.unwrap();
		assert_eq!(
			resp
				.headers()
				.get(header::ACCESS_CONTROL_ALLOW_METHODS)
				.unwrap(),
			"*"
		);
	}

	#[test]
	fn invalid_entries_fail_configuration() {
		let raw: CorsSerde =
			serde_yaml::from_str("allowOrigins: ['https://a']\nallowMethods: ['NOT A METHOD']\n")
				.unwrap();
		assert!(Cors::try_from(raw).is_err());
	}
}
