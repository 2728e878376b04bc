use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
	#[default]
	Plain,
	Json,
}

/// Install the global tracing subscriber. The filter comes from `RUST_LOG`,
/// defaulting to `info`. Safe to call more than once (tests).
pub fn setup_logging(format: LogFormat) {
	INIT.call_once(|| {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
		match format {
			LogFormat::Json => {
				tracing_subscriber::registry()
					.with(filter)
					.with(tracing_subscriber::fmt::layer().json().flatten_event(true))
					.init();
			},
			LogFormat::Plain => {
				tracing_subscriber::registry()
					.with(filter)
					.with(tracing_subscriber::fmt::layer())
					.init();
			},
		}
	});
}
