use mxbridge_core::{Config, Result, err};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the process-wide tracing subscriber from the configured log
/// directive. Safe to call more than once; later calls are no-ops.
pub fn init(config: &Config) -> Result {
	let filter = EnvFilter::try_new(&config.log)
		.map_err(|e| err!(Config("log", "invalid filter directive: {e}")))?;

	let registry = tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer());

	// a second init (tests, embedders with their own subscriber) is fine
	if registry.try_init().is_err() {
		mxbridge_core::debug!("tracing subscriber already installed");
	}

	Ok(())
}
