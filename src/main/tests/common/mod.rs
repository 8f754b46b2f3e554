//! Shared fixture for the integration tests: a bridge wired to the mock
//! homeserver with a recording controller.

use std::sync::{Arc, Mutex, atomic::AtomicBool};

use async_trait::async_trait;
use mxbridge::{
	Bridge, BridgeController, BridgeEvent, BridgeOpts, Config, Result,
	registration::{Namespace, Namespaces, Registration},
	store::Stores,
};
use mxbridge_client::MockHomeserver;
use ruma::{OwnedRoomId, RoomId};
use serde_json::json;

pub struct TestBridge {
	pub bridge: Arc<Bridge>,
	pub mock: Arc<MockHomeserver>,
	pub controller: Arc<RecordingController>,
}

#[derive(Default)]
pub struct RecordingController {
	pub events: Mutex<Vec<BridgeEvent>>,
	pub migrated: Mutex<Vec<(OwnedRoomId, OwnedRoomId)>>,
	pub fail_events: AtomicBool,
}

impl RecordingController {
	pub fn events(&self) -> Vec<BridgeEvent> {
		self.events.lock().expect("test lock").clone()
	}
}

#[async_trait]
impl BridgeController for RecordingController {
	async fn on_event(&self, event: &BridgeEvent) -> Result {
		if self.fail_events.load(std::sync::atomic::Ordering::Relaxed) {
			return Err(mxbridge::Error::EventNotHandled);
		}

		self.events
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
}

pub fn registration() -> Registration {
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
			aliases: Vec::new(),
			rooms: Vec::new(),
		},
		protocols: None,
		rate_limited: Some(false),
		push_ephemeral: None,
	}
}

pub fn test_config() -> Config {
	serde_json::from_value(json!({
		"homeserver_url": "http://localhost:8008",
		"server_name": "example.org",
	}))
	.expect("test config parses")
}

pub async fn bridge_with(tweak: impl FnOnce(&mut Config)) -> TestBridge {
	let mut config = test_config();
	tweak(&mut config);

	let mock = Arc::new(MockHomeserver::new());
	let controller = Arc::new(RecordingController::default());

	let bridge = Bridge::with_client(
		BridgeOpts {
			config,
			registration: registration(),
			controller: controller.clone(),
			stores: Stores::default(),
		},
		mock.clone(),
	)
	.expect("bridge assembles");

	TestBridge { bridge, mock, controller }
}

/// Let spawned queue consumers and workers run.
pub async fn settle() {
	tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

pub fn message(room: &str, sender: &str, eid: &str) -> BridgeEvent {
	serde_json::from_value(json!({
		"event_id": eid,
		"room_id": room,
		"sender": sender,
		"type": "m.room.message",
		"content": {"msgtype": "m.text", "body": "hello"},
	}))
	.expect("test event parses")
}
