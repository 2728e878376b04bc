use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use llmproxy::{app, auth, config, storage, telemetry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Protocol-aware reverse proxy for LLM APIs", long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse configuration (including decision scripts) and exit
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let contents = match (args.config, args.file) {
		(Some(_), Some(_)) => {
			anyhow::bail!("only one of --config or --file")
		},
		(Some(config), None) => config,
		(None, Some(file)) => std::fs::read_to_string(&file)?,
		(None, None) => String::new(),
	};
	let config = config::parse_config(&contents)?;
	telemetry::setup_logging(config.logging.format);

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?;
	if args.validate_only {
		return runtime.block_on(validate(config));
	}
	runtime.block_on(async move {
		info!("starting llmproxy");
		app::run(Arc::new(config)).await?.wait_termination().await
	})
}

async fn validate(config: config::Config) -> anyhow::Result<()> {
	// Opening storage exercises every connection reference; building the
	// pipeline compiles every decision script.
	let storage = storage::StorageManager::connect(&config.storage).await?;
	auth::AuthPipeline::new(&config.auth, &storage)?;
	storage.close().await;
	println!("Configuration is valid!");
	Ok(())
}
