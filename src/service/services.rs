use std::sync::Arc;

use futures::FutureExt;
use mxbridge_client::Homeserver;
use mxbridge_core::{Result, Server, debug, error, info};
use tokio::task::JoinSet;

use crate::{
	Args, Service, activity, appservice, ban_sync, blocker, controller::BridgeController,
	encryption, globals, intent, link_validator, media_proxy, membership_cache,
	membership_queue, room_upgrade, service::Dep, service_room, state_lookup, store,
	store::Stores, user_activity,
};

/// Cross-service dependency surface. Each service holds an `Arc` of this and
/// reaches siblings through the lazily-bound handles, which breaks the
/// construction-order cycles between the bridge facade, intents and queues.
pub struct OnceServices {
	pub server: Arc<Server>,
	pub client: Arc<dyn Homeserver>,
	pub controller: Arc<dyn BridgeController>,

	pub globals: Dep<globals::Service>,
	pub store: Dep<store::Service>,
	pub membership_cache: Dep<membership_cache::Service>,
	pub intent: Dep<intent::Service>,
	pub membership_queue: Dep<membership_queue::Service>,
	pub state_lookup: Dep<state_lookup::Service>,
	pub activity: Dep<activity::Service>,
	pub user_activity: Dep<user_activity::Service>,
	pub ban_sync: Dep<ban_sync::Service>,
	pub blocker: Dep<blocker::Service>,
	pub room_upgrade: Dep<room_upgrade::Service>,
	pub encryption: Dep<encryption::Service>,
	pub media_proxy: Dep<media_proxy::Service>,
	pub service_room: Dep<service_room::Service>,
	pub link_validator: Dep<link_validator::Service>,
	pub appservice: Dep<appservice::Service>,
}

/// The assembled bridge core: every component built, bound and startable.
pub struct Services {
	pub services: Arc<OnceServices>,
	pub server: Arc<Server>,
	workers: std::sync::Mutex<JoinSet<(&'static str, Result)>>,
	list: Vec<(&'static str, Arc<dyn Service>)>,
}

impl Services {
	pub fn build(
		server: Arc<Server>,
		client: Arc<dyn Homeserver>,
		controller: Arc<dyn BridgeController>,
		stores: Stores,
	) -> Result<Arc<Self>> {
		let services = Arc::new(OnceServices {
			server: server.clone(),
			client,
			controller,
			globals: Dep::default(),
			store: Dep::default(),
			membership_cache: Dep::default(),
			intent: Dep::default(),
			membership_queue: Dep::default(),
			state_lookup: Dep::default(),
			activity: Dep::default(),
			user_activity: Dep::default(),
			ban_sync: Dep::default(),
			blocker: Dep::default(),
			room_upgrade: Dep::default(),
			encryption: Dep::default(),
			media_proxy: Dep::default(),
			service_room: Dep::default(),
			link_validator: Dep::default(),
			appservice: Dep::default(),
		});

		let args = Args {
			server: &server,
			client: &services.client,
			controller: &services.controller,
			services: &services,
			stores: &stores,
		};

		let mut list: Vec<(&'static str, Arc<dyn Service>)> = Vec::new();

		macro_rules! build {
			($name:ident, $module:ident) => {{
				let built = $module::Service::build(&args)?;
				services.$name.bind(built.clone());
				list.push((stringify!($name), built));
			}};
		}

		// leaves first, facade last
		build!(globals, globals);
		build!(store, store);
		build!(membership_cache, membership_cache);
		build!(intent, intent);
		build!(membership_queue, membership_queue);
		build!(state_lookup, state_lookup);
		build!(activity, activity);
		build!(user_activity, user_activity);
		build!(ban_sync, ban_sync);
		build!(blocker, blocker);
		build!(room_upgrade, room_upgrade);
		build!(encryption, encryption);
		build!(media_proxy, media_proxy);
		build!(service_room, service_room);
		build!(link_validator, link_validator);
		build!(appservice, appservice);

		Ok(Arc::new(Self {
			services,
			server,
			workers: std::sync::Mutex::new(JoinSet::new()),
			list,
		}))
	}

	/// Spawn every service worker on the server runtime.
	pub fn start(&self) -> Result {
		let mut workers = self.workers.lock().expect("worker set");
		for (name, service) in &self.list {
			debug!("starting service worker {name}");
			let name = *name;
			let worker = service.clone().worker();
			workers.spawn_on(
				worker.map(move |result| (name, result)),
				self.server.runtime(),
			);
		}

		info!("all service workers started");
		Ok(())
	}

	/// Interrupt every worker and await their completion.
	pub async fn stop(&self) {
		// idle workers park on the shutdown signal
		self.server.shutdown().ok();

		for (name, service) in self.list.iter().rev() {
			debug!("interrupting service worker {name}");
			service.interrupt().await;
		}

		let mut workers = {
			let mut guard = self.workers.lock().expect("worker set");
			std::mem::take(&mut *guard)
		};

		while let Some(joined) = workers.join_next().await {
			match joined {
				| Ok((name, Ok(()))) => debug!("service worker {name} finished"),
				| Ok((name, Err(e))) => error!("service worker {name} finished: {e}"),
				| Err(e) => error!("service worker panicked: {e}"),
			}
		}
	}
}
