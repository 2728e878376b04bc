use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, trace};

use crate::http::{Body, HeaderMap, Method, Response, header, strip_hop_by_hop_headers};
use crate::proxy::ProxyError;

/// Streamed responses are relayed in reads of at most this size, each
/// forwarded to the client as soon as it arrives.
pub const MAX_CHUNK: usize = 16 * 1024;

/// The client used for backend attempts. Reads are bounded; the total
/// request duration is not (streamed completions can be arbitrarily long).
pub struct UpstreamClient {
	client: reqwest::Client,
	read_timeout: Duration,
}

impl UpstreamClient {
	pub fn new(connect_timeout: Duration, read_timeout: Duration) -> anyhow::Result<UpstreamClient> {
		let client = reqwest::Client::builder()
			.connect_timeout(connect_timeout)
			.read_timeout(read_timeout)
			.build()?;
		Ok(UpstreamClient {
			client,
			read_timeout,
		})
	}

	/// Forward one attempt to `<base><path_and_query>`, preserving method,
	/// headers (minus hop-by-hop) and body, and stream the response back
	/// without buffering.
	pub async fn send(
		&self,
		base: &str,
		method: &Method,
		path_and_query: &str,
		headers: &HeaderMap,
		body: Bytes,
	) -> Result<Response, ProxyError> {
		let url = format!("{base}{path_and_query}");
		let mut out_headers = headers.clone();
		strip_hop_by_hop_headers(&mut out_headers);
		// The backend sees its own authority; length is recomputed from the
		// (possibly replayed) body.
		out_headers.remove(header::HOST);
		out_headers.remove(header::CONTENT_LENGTH);

		trace!(%url, "forwarding request");
		let sent = self
			.client
			.request(method.clone(), &url)
			.headers(out_headers)
			.body(body)
			.send();
		// Bound time-to-response-headers; the body itself is only bounded
		// per-read.
		let resp = match tokio::time::timeout(self.read_timeout, sent).await {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => {
				debug!(%url, "upstream call failed: {e}");
				return Err(if e.is_timeout() {
					ProxyError::RequestTimeout
				} else {
					ProxyError::UpstreamCallFailed(e.to_string())
				});
			},
			Err(_) => return Err(ProxyError::RequestTimeout),
		};

		let status = resp.status();
		let mut builder = ::http::Response::builder().status(status);
		if let Some(h) = builder.headers_mut() {
			*h = resp.headers().clone();
			strip_hop_by_hop_headers(h);
		}
		// Re-chunk oversized reads; one chunk in flight at a time, no
		// proxy-side accumulation.
		let stream = resp.bytes_stream().flat_map(|item| {
			let chunks: Vec<Result<Bytes, reqwest::Error>> = match item {
				Ok(bytes) => split_chunks(bytes).into_iter().map(Ok).collect(),
				Err(e) => vec![Err(e)],
			};
			futures_util::stream::iter(chunks)
		});
		builder
			.body(Body::from_stream(stream))
			.map_err(|e| ProxyError::Internal(e.into()))
	}
}

fn split_chunks(bytes: Bytes) -> Vec<Bytes> {
	if bytes.len() <= MAX_CHUNK {
		return vec![bytes];
	}
	let mut rest = bytes;
	let mut out = Vec::with_capacity(rest.len() / MAX_CHUNK + 1);
	while rest.len() > MAX_CHUNK {
		out.push(rest.split_to(MAX_CHUNK));
	}
	if !rest.is_empty() {
		out.push(rest);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chunk_splitting() {
		let small = Bytes::from(vec![0u8; 100]);
		assert_eq!(split_chunks(small).len(), 1);

		let big = Bytes::from(vec![0u8; MAX_CHUNK * 2 + 1]);
		let chunks = split_chunks(big);
		assert_eq!(chunks.len(), 3);
		assert_eq!(chunks[0].len(), MAX_CHUNK);
		assert_eq!(chunks[1].len(), MAX_CHUNK);
		assert_eq!(chunks[2].len(), 1);
		let total: usize = chunks.iter().map(|c| c.len()).sum();
		assert_eq!(total, MAX_CHUNK * 2 + 1);
	}
}
