//! Serde helpers shared by the configuration surface.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Durations are configured as human strings ("100ms", "5s", "1m").
pub mod serde_dur {
	use super::*;

	pub fn serialize<S: Serializer>(dur: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&format!("{}ms", dur.as_millis()))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(deserializer)?;
		duration_str::parse(&raw).map_err(serde::de::Error::custom)
	}
}

pub mod serde_dur_option {
	use super::*;

	pub fn serialize<S: Serializer>(
		dur: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match dur {
			Some(d) => serializer.serialize_some(&format!("{}ms", d.as_millis())),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		let raw = Option::<String>::deserialize(deserializer)?;
		raw
			.map(|s| duration_str::parse(&s).map_err(serde::de::Error::custom))
			.transpose()
	}
}

/// Mask an API key for logs and usage records: keep the first 6 and last 4
/// characters, or fully redact short keys.
pub fn mask_key(key: &str) -> String {
	if key.is_empty() {
		return String::new();
	}
	if key.len() <= 10 {
		return "****".to_string();
	}
	format!("{}****{}", &key[..6], &key[key.len() - 4..])
}
