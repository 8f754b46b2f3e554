use std::sync::Arc;

use mxbridge_client::{Homeserver, MatrixClient};
use mxbridge_core::{
	Config, Result, Server, config::Registration, debug, err, info, utils::LogErr, warn,
};
use mxbridge_service::{BridgeController, Intent, Services, store::Stores};
use ruma::UserId;

/// Everything needed to assemble a bridge.
pub struct BridgeOpts {
	pub config: Config,
	pub registration: Registration,
	pub controller: Arc<dyn BridgeController>,

	/// Persistent stores; the default is in-memory.
	pub stores: Stores,
}

/// The assembled bridge: server state, all services, and the HTTP surface,
/// one instance per process.
pub struct Bridge {
	pub server: Arc<Server>,
	pub services: Arc<Services>,
}

impl Bridge {
	/// Build with the real homeserver client. Must be called from within a
	/// tokio runtime.
	pub fn new(opts: BridgeOpts) -> Result<Arc<Self>> {
		let server = Arc::new(Server::new(
			opts.config,
			opts.registration,
			tokio::runtime::Handle::try_current().ok(),
		));

		let client: Arc<dyn Homeserver> = Arc::new(MatrixClient::new(&server)?);
		Self::assemble(server, client, opts.controller, opts.stores)
	}

	/// Build against an injected homeserver implementation (tests, custom
	/// transports).
	pub fn with_client(opts: BridgeOpts, client: Arc<dyn Homeserver>) -> Result<Arc<Self>> {
		let server = Arc::new(Server::new(
			opts.config,
			opts.registration,
			tokio::runtime::Handle::try_current().ok(),
		));

		Self::assemble(server, client, opts.controller, opts.stores)
	}

	fn assemble(
		server: Arc<Server>,
		client: Arc<dyn Homeserver>,
		controller: Arc<dyn BridgeController>,
		stores: Stores,
	) -> Result<Arc<Self>> {
		let services = Services::build(server.clone(), client, controller, stores)?;

		Ok(Arc::new(Self { server, services }))
	}

	/// Start the service workers, serve the appservice endpoint, and block
	/// until shutdown; then wind everything down.
	pub async fn run(self: &Arc<Self>) -> Result {
		info!(
			server_name = %self.server.name,
			bot = %self.server.bot_user_id(),
			"bridge starting"
		);

		self.services.start()?;

		// a wrong displayname on the bot is worth a log line, not a crash
		self.bot_intent()
			.ensure_registered()
			.await
			.log_err()
			.ok();

		let router = mxbridge_router::build(self.services.clone());
		mxbridge_router::serve(&self.server, router).await?;

		self.services.stop().await;
		info!("bridge stopped");
		Ok(())
	}

	#[inline]
	#[must_use]
	pub fn get_intent(&self, user_id: &UserId) -> Arc<Intent> {
		self.services.services.intent.get(user_id)
	}

	#[inline]
	#[must_use]
	pub fn bot_intent(&self) -> Arc<Intent> { self.services.services.intent.bot() }

	pub fn shutdown(&self) -> Result { self.server.shutdown() }

	/// SIGHUP path: reload the config file, swap the snapshot, refresh the
	/// room-link rules, and tell the embedder.
	pub async fn reload_config(&self, path: Option<&std::path::Path>) -> Result {
		let Some(path) = path else {
			return Err(err!("no config file to reload from"));
		};

		let config = Config::load(Some(path))?;

		if let Some(link) = &config.room_link_validation {
			match load_link_rules(link) {
				| Ok(Some(rules)) => self
					.services
					.services
					.link_validator
					.update_rules(rules),
				| Ok(None) => {},
				| Err(e) => warn!("room-link rules not reloaded: {e}"),
			}
		}

		self.server.config.reload(config.clone());
		debug!("configuration reloaded from {path:?}");

		self.services.services.ban_sync.resync().await;

		self.services
			.services
			.controller
			.on_config_changed(&config)
			.await
			.log_err()
			.ok();

		self.server
			.reloading
			.store(false, std::sync::atomic::Ordering::Release);

		Ok(())
	}
}

fn load_link_rules(
	link: &mxbridge_core::config::LinkValidationConfig,
) -> Result<Option<mxbridge_service::link_validator::Rules>> {
	if let Some(path) = &link.rule_file {
		let file = std::fs::File::open(path)
			.map_err(|e| err!("cannot open rule file {path:?}: {e}"))?;
		return serde_json::from_reader(file)
			.map(Some)
			.map_err(Into::into);
	}

	link.rules
		.clone()
		.map(serde_json::from_value)
		.transpose()
		.map_err(Into::into)
}
