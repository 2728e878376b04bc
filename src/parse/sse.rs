use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// One Server-Sent-Events frame: the joined `data:` lines plus the optional
/// event name. Comments and unknown fields are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
	pub event: Option<String>,
	pub data: String,
}

/// Minimal SSE decoder over a byte stream: frames are blocks separated by a
/// blank line, fields are `name: value` lines. Handles `\n` and `\r\n`
/// terminators.
pub struct SseDecoder {
	max_size: usize,
}

impl SseDecoder {
	pub fn new(max_size: usize) -> SseDecoder {
		SseDecoder { max_size }
	}
}

/// Byte offset just past the first blank-line separator, if present.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
	let mut i = 0;
	while i < buf.len() {
		if buf[i] == b'\n' {
			if buf[i + 1..].first() == Some(&b'\n') {
				return Some(i + 2);
			}
			if buf[i + 1..].starts_with(b"\r\n") {
				return Some(i + 3);
			}
		}
		i += 1;
	}
	None
}

fn parse_frame(block: &[u8]) -> Option<SseFrame> {
	let text = String::from_utf8_lossy(block);
	let mut event = None;
	let mut data_lines: Vec<&str> = Vec::new();
	for line in text.lines() {
		let line = line.strip_suffix('\r').unwrap_or(line);
		if line.starts_with(':') {
			continue;
		}
		if let Some(rest) = line.strip_prefix("data:") {
			data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
		} else if let Some(rest) = line.strip_prefix("event:") {
			event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
		}
	}
	if data_lines.is_empty() && event.is_none() {
		return None;
	}
	Some(SseFrame {
		event,
		data: data_lines.join("\n"),
	})
}

impl Decoder for SseDecoder {
	type Item = SseFrame;
	type Error = std::io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		loop {
			let Some(end) = find_frame_end(src) else {
				if src.len() > self.max_size {
					// Oversized frame: drop the buffered prefix rather than
					// growing without bound. Observation is best-effort.
					src.clear();
				}
				return Ok(None);
			};
			let block = src.split_to(end);
			match parse_frame(&block) {
				Some(frame) => return Ok(Some(frame)),
				// Comment-only block: keep scanning.
				None => continue,
			}
		}
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if let Some(frame) = self.decode(src)? {
			return Ok(Some(frame));
		}
		if src.is_empty() {
			return Ok(None);
		}
		let block = src.split_to(src.len());
		Ok(parse_frame(&block))
	}
}

/// Accumulates the entire (capped) body and emits it once at end of stream.
/// Used to read `usage` out of non-streamed JSON responses without touching
/// the bytes sent to the client.
pub struct JsonTailDecoder {
	cap: usize,
	overflowed: bool,
}

impl JsonTailDecoder {
	pub fn new(cap: usize) -> JsonTailDecoder {
		JsonTailDecoder {
			cap,
			overflowed: false,
		}
	}
}

impl Decoder for JsonTailDecoder {
	type Item = bytes::Bytes;
	type Error = std::io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() > self.cap {
			self.overflowed = true;
			src.clear();
		}
		Ok(None)
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if self.overflowed || src.is_empty() {
			return Ok(None);
		}
		let all = src.split_to(src.len());
		Ok(Some(all.freeze()))
	}
}
