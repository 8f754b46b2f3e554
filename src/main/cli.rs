use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use mxbridge_core::{Config, Result, config::Registration, error, info};
use mxbridge_service::{BridgeController, store::Stores};

use crate::{Bridge, BridgeOpts};

/// Command-line surface for a concrete bridge binary.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
	/// Generate a registration file and exit.
	#[arg(short = 'r', long)]
	pub generate_registration: bool,

	/// Bridge configuration file (YAML).
	#[arg(short = 'c', long)]
	pub config: Option<PathBuf>,

	/// Registration file to read, or to write with `-r`.
	#[arg(short = 'f', long, default_value = "registration.yaml")]
	pub file: PathBuf,

	/// URL the homeserver pushes transactions to (with `-r`).
	#[arg(short = 'u', long)]
	pub url: Option<String>,

	/// Sender localpart for the bridge bot (with `-r`).
	#[arg(short = 'l', long)]
	pub localpart: Option<String>,

	/// Override the configured listen port.
	#[arg(short = 'p', long)]
	pub port: Option<u16>,
}

impl Cli {
	/// Parse the process arguments; usage errors exit with code 1.
	#[must_use]
	pub fn parse_args() -> Self {
		match Self::try_parse() {
			| Ok(cli) => cli,
			| Err(e) => {
				e.print().ok();
				std::process::exit(1);
			},
		}
	}

	/// Drive the whole bridge lifecycle for a controller. Returns the
	/// process exit code.
	#[must_use]
	pub fn run(self, controller: Arc<dyn BridgeController>, stores: Stores) -> ExitCode {
		match self.run_inner(controller, stores) {
			| Ok(()) => ExitCode::SUCCESS,
			| Err(e) => {
				error!("{e}");
				ExitCode::FAILURE
			},
		}
	}

	fn run_inner(self, controller: Arc<dyn BridgeController>, stores: Stores) -> Result {
		if self.generate_registration {
			return self.generate();
		}

		let Some(config_path) = self.config.clone() else {
			return Err(mxbridge_core::err!("missing required --config"));
		};

		let mut config = Config::load(Some(&config_path))?;
		if let Some(port) = self.port {
			config.port = port;
		}

		crate::logging::init(&config)?;

		let registration = Registration::load(&self.file)?;

		let runtime = tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.build()?;

		runtime.block_on(async move {
			let bridge = Bridge::new(BridgeOpts {
				config,
				registration,
				controller,
				stores,
			})?;

			crate::signal::install(&bridge, Some(config_path));
			bridge.run().await
		})
	}

	fn generate(&self) -> Result {
		let url = self
			.url
			.as_deref()
			.unwrap_or("http://localhost:8090");
		let localpart = self.localpart.as_deref().unwrap_or("bridgebot");

		// the server name only shapes the example namespace; the admin
		// adjusts the generated file anyway
		let server_name = self
			.config
			.as_deref()
			.and_then(|path| Config::load(Some(path)).ok())
			.map_or_else(
				|| ruma::OwnedServerName::try_from("localhost").expect("valid server name"),
				|config| config.server_name,
			);

		let registration =
			Registration::generate(localpart, url, localpart, &server_name);
		registration.save(&self.file)?;

		info!("wrote registration to {:?}", self.file);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use clap::Parser;

	use super::Cli;

	#[test]
	fn registration_generation_flags_parse() {
		let cli = Cli::parse_from([
			"bridge",
			"-r",
			"-u",
			"https://bridge.example.org",
			"-f",
			"/tmp/reg.yaml",
			"-l",
			"gitterbot",
		]);

		assert!(cli.generate_registration);
		assert_eq!(cli.url.as_deref(), Some("https://bridge.example.org"));
		assert_eq!(cli.localpart.as_deref(), Some("gitterbot"));
		assert_eq!(cli.file.to_str(), Some("/tmp/reg.yaml"));
	}

	#[test]
	fn run_flags_parse() {
		let cli = Cli::parse_from(["bridge", "-c", "config.yaml", "-p", "9999"]);
		assert!(!cli.generate_registration);
		assert_eq!(cli.port, Some(9999));
		assert_eq!(cli.config.as_ref().unwrap().to_str(), Some("config.yaml"));
	}

	#[test]
	fn bad_arguments_error() {
		assert!(Cli::try_parse_from(["bridge", "--nonsense"]).is_err());
	}
}
