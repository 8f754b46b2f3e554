//! Shared fixtures for service tests: a mock homeserver, a recording
//! controller, and a fully-built `Services` with in-memory stores.

use std::sync::{
	Arc, Mutex,
	atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use mxbridge_client::MockHomeserver;
use mxbridge_core::{
	BridgeEvent, Config, Result, Server, err,
	config::registration::{Namespace, Namespaces, Registration},
};
use ruma::{OwnedRoomId, RoomId};
use serde_json::json;

use crate::{BridgeController, Services, store::Stores};

pub(crate) struct Harness {
	pub services: Arc<Services>,
	pub mock: Arc<MockHomeserver>,
	pub controller: Arc<TestController>,
}

impl Harness {
	pub fn server(&self) -> &Arc<Server> { &self.services.server }
}

#[derive(Default)]
pub(crate) struct TestController {
	pub events: Mutex<Vec<BridgeEvent>>,
	pub ephemeral: Mutex<Vec<BridgeEvent>>,
	pub migrated: Mutex<Vec<(OwnedRoomId, OwnedRoomId)>>,
	pub activity_counts: Mutex<Vec<u64>>,
	pub blocks: AtomicU64,
	pub unblocks: AtomicU64,
	pub fail_block: AtomicBool,
	pub fail_event: AtomicBool,
	pub wants_ephemeral: AtomicBool,
}

impl TestController {
	pub fn events(&self) -> Vec<BridgeEvent> {
		self.events.lock().expect("test lock").clone()
	}

	pub fn event_ids(&self) -> Vec<String> {
		self.events()
			.iter()
			.map(|e| e.event_id.to_string())
			.collect()
	}
}

#[async_trait]
impl BridgeController for TestController {
	async fn on_event(&self, event: &BridgeEvent) -> Result {
		if self.fail_event.load(Ordering::Relaxed) {
			return Err(mxbridge_core::Error::EventNotHandled);
		}

		self.events
			.lock()
			.expect("test lock")
			.push(event.clone());
		Ok(())
	}

	async fn on_ephemeral(&self, event: &BridgeEvent) -> Result {
		self.ephemeral
			.lock()
			.expect("test lock")
			.push(event.clone());
		Ok(())
	}

	async fn on_room_migrated(&self, old: &RoomId, new: &RoomId) -> Result {
		self.migrated
			.lock()
			.expect("test lock")
			.push((old.to_owned(), new.to_owned()));
		Ok(())
	}

	async fn on_user_activity_changed(&self, active_users: u64) -> Result {
		self.activity_counts
			.lock()
			.expect("test lock")
			.push(active_users);
		Ok(())
	}

	async fn block_bridge(&self) -> Result {
		if self.fail_block.load(Ordering::Relaxed) {
			return Err(err!("block override failed"));
		}
		self.blocks.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	async fn unblock_bridge(&self) -> Result {
		if self.fail_block.load(Ordering::Relaxed) {
			return Err(err!("unblock override failed"));
		}
		self.unblocks.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	fn wants_ephemeral(&self) -> bool { self.wants_ephemeral.load(Ordering::Relaxed) }
}

pub(crate) fn test_config() -> Config {
	serde_json::from_value(json!({
		"homeserver_url": "http://localhost:8008",
		"server_name": "example.org",
	}))
	.expect("test config parses")
}

pub(crate) fn test_registration() -> Registration {
	Registration {
		id: "mxbridge-test".to_owned(),
		url: Some("http://localhost:8090".to_owned()),
		as_token: "as-token".to_owned(),
		hs_token: "hs-token".to_owned(),
		sender_localpart: "bridgebot".to_owned(),
		namespaces: Namespaces {
			users: vec![Namespace {
				exclusive: true,
				regex: r"@remote_.*:example\.org".to_owned(),
			}],
			aliases: vec![Namespace {
				exclusive: true,
				regex: r"#remote_.*:example\.org".to_owned(),
			}],
			rooms: Vec::new(),
		},
		protocols: None,
		rate_limited: Some(false),
		push_ephemeral: None,
	}
}

pub(crate) async fn test_services() -> Harness {
	test_services_with(|_| {}).await
}

pub(crate) async fn test_services_with(tweak: impl FnOnce(&mut Config)) -> Harness {
	let mut config = test_config();
	tweak(&mut config);

	let server = Arc::new(Server::new(
		config,
		test_registration(),
		Some(tokio::runtime::Handle::current()),
	));

	let mock = Arc::new(MockHomeserver::new());
	let controller = Arc::new(TestController::default());

	let services = Services::build(
		server,
		mock.clone(),
		controller.clone(),
		Stores::default(),
	)
	.expect("services build");

	Harness { services, mock, controller }
}
