mod common;

use common::{bridge_with, message, settle};
use ruma::{room_id, user_id};

#[tokio::test]
async fn services_start_and_stop_cleanly() {
	let harness = bridge_with(|_| {}).await;

	harness.bridge.services.start().unwrap();
	harness.bridge.server.shutdown().unwrap();
	harness.bridge.services.stop().await;
}

#[tokio::test]
async fn inbound_transaction_reaches_the_controller() {
	let harness = bridge_with(|_| {}).await;
	harness.bridge.services.start().unwrap();

	harness
		.bridge
		.services
		.services
		.appservice
		.handle_transaction(
			"smoke-txn",
			vec![message("!r:example.org", "@human:example.org", "$smoke:example.org")],
			Vec::new(),
		)
		.await
		.unwrap();
	settle().await;

	let events = harness.controller.events();
	assert_eq!(events.len(), 1);
	assert_eq!(events[0].event_id.as_str(), "$smoke:example.org");

	harness.bridge.server.shutdown().unwrap();
	harness.bridge.services.stop().await;
}

#[tokio::test]
async fn intents_act_as_their_user() {
	let harness = bridge_with(|_| {}).await;
	let ghost = user_id!("@remote_ghost:example.org");
	let room = room_id!("!r:example.org");

	let intent = harness.bridge.get_intent(ghost);
	intent
		.send_event(room, "m.room.message", serde_json::json!({"body": "hi"}))
		.await
		.unwrap();

	assert!(harness.mock.is_registered("remote_ghost"));
	assert!(harness.mock.is_joined(room, ghost));

	let sent = harness.mock.sent();
	assert_eq!(sent.len(), 1);
	assert_eq!(sent[0].as_user.as_deref(), Some(ghost));
}

#[tokio::test]
async fn bot_intent_uses_the_appservice_identity() {
	let harness = bridge_with(|_| {}).await;
	let room = room_id!("!announce:example.org");

	harness
		.bridge
		.bot_intent()
		.send_event(room, "m.room.message", serde_json::json!({"body": "up"}))
		.await
		.unwrap();

	let sent = harness.mock.sent();
	assert_eq!(sent[0].as_user, None);
}
