//! Inbound transaction ingestion: the glue between the appservice HTTP
//! surface and every other component. Transactions are deduplicated by id,
//! each event feeds the caches and watchers, and surviving events are
//! dispatched to the embedder through the configured queue flavor.

mod event_queue;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use mxbridge_core::{
	BridgeEvent, MemberContent, Membership, Result, debug, debug_warn,
	utils::{LogErr, RequestCache},
	warn,
};
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomAliasId, RoomId, UserId};
use serde_json::{Value as JsonValue, json};

use self::event_queue::EventQueue;
use crate::services::OnceServices;

pub const BRIDGE_ERROR_EVENT_TYPE: &str = "de.nasnotfound.bridge_error";
pub const BRIDGE_INFO_STATE_TYPE: &str = "uk.half-shot.bridge";

/// MSC2346 bridge-info payload for a bridged room.
#[derive(Clone, Debug)]
pub struct BridgeInfo {
	pub bridge_name: String,
	pub creator: Option<OwnedUserId>,
	pub protocol: BridgeInfoItem,
	pub network: Option<BridgeInfoItem>,
	pub channel: BridgeInfoItem,
}

#[derive(Clone, Debug, Default)]
pub struct BridgeInfoItem {
	pub id: String,
	pub displayname: Option<String>,
	pub external_url: Option<String>,
}

impl BridgeInfoItem {
	fn to_json(&self) -> JsonValue {
		json!({
			"id": self.id,
			"displayname": self.displayname,
			"external_url": self.external_url,
		})
	}
}

pub struct Service {
	seen_txns: RequestCache<String, ()>,
	queue: EventQueue,
	emit_bridge_errors: bool,
	services: Arc<OnceServices>,
}

#[async_trait]
impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		let config = args.server.config.get();
		let services = args.services.clone();

		let consumer: event_queue::Consumer = {
			let services = services.clone();
			let emit = config.emit_bridge_errors;
			Arc::new(move |event| consume(services.clone(), emit, event).boxed())
		};

		Ok(Arc::new(Self {
			seen_txns: RequestCache::new(Duration::from_secs(60 * 60), 1024),
			queue: EventQueue::new(config.event_queue, args.server.runtime().clone(), consumer),
			emit_bridge_errors: config.emit_bridge_errors,
			services,
		}))
	}

	async fn interrupt(&self) { self.queue.close(); }

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	/// Handle one appservice transaction. Always at most once per txn id;
	/// event-level failures are contained so the homeserver gets its 200
	/// and does not replay the batch forever.
	pub async fn handle_transaction(
		&self,
		txn_id: &str,
		events: Vec<BridgeEvent>,
		ephemeral: Vec<BridgeEvent>,
	) -> Result {
		if self.seen_txns.peek(txn_id).is_some() {
			debug!(txn_id, "duplicate transaction ignored");
			return Ok(());
		}
		self.seen_txns.insert(txn_id.to_owned(), ());

		let metrics = &self.services.server.metrics;
		metrics
			.transactions_received
			.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

		if self.services.blocker.is_blocked().await {
			debug_warn!(txn_id, "bridge is blocked, transaction dropped");
			return Ok(());
		}

		for event in events {
			let event_id = event.event_id.clone();
			if let Err(e) = self.process_event(event).await {
				warn!(event = %event_id, "inbound event processing failed: {e}");
			}
		}

		for event in ephemeral {
			self.dispatch_ephemeral(&event).await;
		}

		Ok(())
	}

	async fn process_event(&self, event: BridgeEvent) -> Result {
		let services = &self.services;
		services
			.server
			.metrics
			.events_processed
			.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

		self.track_state(&event).await;

		// policy rooms feed the ban ruleset
		if let Some(room_id) = event.room_id.as_deref() {
			if services.ban_sync.is_policy_room(room_id) {
				services.ban_sync.handle_event(&event).log_err().ok();
			}
		}

		// admission control; probe failures fail open
		match services.ban_sync.is_user_banned(&event.sender).await {
			| Ok(Some(verdict)) => {
				warn!(sender = %event.sender, ?verdict, "event dropped: sender not admitted");
				return Ok(());
			},
			| Ok(None) => {},
			| Err(e) => debug_warn!(sender = %event.sender, "ban check failed open: {e}"),
		}

		// real users feed the activity trackers
		if !services.globals.is_our_user(&event.sender) {
			services
				.activity
				.set_last_active_time(&event.sender);
			services
				.user_activity
				.record_active(&event.sender, false)
				.await
				.log_err()
				.ok();
		}

		if event.is_type("m.room.tombstone") {
			services
				.room_upgrade
				.on_tombstone(&event)
				.await
				.log_err()
				.ok();
		}

		// an invite for the bot may complete a pending upgrade
		if self.is_bot_invite(&event) {
			if let Some(room_id) = event.room_id.as_deref() {
				services
					.room_upgrade
					.on_invite(room_id)
					.await
					.log_err()
					.ok();
			}
		}

		// encrypted rooms hand over to the broker; the sync side delivers
		if event.is_type("m.room.encrypted") && services.encryption.is_enabled() {
			match services.encryption.on_as_event(&event).await {
				| Ok(Some(decrypted)) => return self.dispatch(decrypted).await,
				| Ok(None) => return Ok(()),
				| Err(e) => {
					warn!(event = %event.event_id, "encrypted event not brokered: {e}");
					return Ok(());
				},
			}
		}

		// echo suppression: our own ghosts' and bot's events stop here
		if services.globals.is_our_user(&event.sender) {
			return Ok(());
		}

		self.dispatch(event).await
	}

	/// Feed caches and lookups from a state event.
	async fn track_state(&self, event: &BridgeEvent) {
		let services = &self.services;

		if event.is_state() {
			if let (Some(room_id), Some(state_key)) =
				(event.room_id.as_deref(), event.state_key.as_deref())
			{
				if event.is_type("m.room.member")
					&& let Ok(target) = UserId::parse(state_key)
					&& let Some(content) = event.content_as::<MemberContent>()
				{
					services
						.membership_cache
						.on_member_event(room_id, &target, &content);
				}

				if event.is_type("m.room.power_levels")
					&& let Some(content) = event.content_as::<mxbridge_core::PowerLevelsContent>()
				{
					services
						.membership_cache
						.set_power_levels(room_id, content);
				}
			}

			services.intent.on_event(event);
		}

		services.state_lookup.on_event(event).await;
	}

	fn is_bot_invite(&self, event: &BridgeEvent) -> bool {
		event.is_type("m.room.member")
			&& event.state_key.as_deref()
				== Some(self.services.globals.bot_user_id().as_str())
			&& event
				.content_as::<MemberContent>()
				.is_some_and(|m| m.membership == Membership::Invite)
	}

	/// Dispatch an event to the embedder through the configured queue.
	pub async fn dispatch(&self, event: BridgeEvent) -> Result { self.queue.push(event) }

	pub async fn dispatch_ephemeral(&self, event: &BridgeEvent) {
		if !self.services.controller.wants_ephemeral() {
			return;
		}

		self.services
			.controller
			.on_ephemeral(event)
			.await
			.log_err()
			.ok();
	}

	// --- homeserver queries -------------------------------------------

	/// `GET /users/{userId}`: provision the user when the embedder claims
	/// it. True means the user now exists.
	pub async fn user_query(&self, user_id: &UserId) -> Result<bool> {
		let Some(provision) = self
			.services
			.controller
			.on_user_query(user_id)
			.await?
		else {
			return Ok(false);
		};

		let intent = self.services.intent.get(user_id);
		intent.ensure_registered().await?;
		intent
			.ensure_profile(
				provision.displayname.as_deref(),
				provision.avatar_url.as_deref(),
			)
			.await?;

		Ok(true)
	}

	/// `GET /rooms/{alias}`: create the room when the embedder claims it.
	pub async fn alias_query(&self, alias: &RoomAliasId) -> Result<Option<OwnedRoomId>> {
		let Some(provision) = self
			.services
			.controller
			.on_alias_query(alias)
			.await?
		else {
			return Ok(None);
		};

		let room_id = self
			.services
			.intent
			.bot()
			.create_room(crate::intent::CreateRoomOpts {
				create_as_client: false,
				options: provision.options,
			})
			.await?;

		Ok(Some(room_id))
	}

	// --- outward helpers ----------------------------------------------

	/// Publish MSC2346 bridge info into a bridged room.
	pub async fn set_bridge_info(
		&self,
		room_id: &RoomId,
		info: &BridgeInfo,
	) -> Result<OwnedEventId> {
		let network_id = info
			.network
			.as_ref()
			.map_or(info.protocol.id.as_str(), |n| n.id.as_str());

		let state_key = format!(
			"{}:/{}/{}",
			info.bridge_name,
			urlencoding::encode(network_id),
			urlencoding::encode(&info.channel.id),
		);

		let mut content = json!({
			"bridgebot": self.services.globals.bot_user_id(),
			"protocol": info.protocol.to_json(),
			"channel": info.channel.to_json(),
		});
		if let Some(creator) = &info.creator {
			content["creator"] = json!(creator);
		}
		if let Some(network) = &info.network {
			content["network"] = network.to_json();
		}

		self.services
			.intent
			.bot()
			.send_state_event(room_id, BRIDGE_INFO_STATE_TYPE, &state_key, content)
			.await
	}
}

/// Queue consumer: hand the event to the embedder, reporting rejections
/// back into the room when configured.
async fn consume(services: Arc<OnceServices>, emit_bridge_errors: bool, event: BridgeEvent) {
	let Err(e) = services.controller.on_event(&event).await else {
		return;
	};

	warn!(event = %event.event_id, "event handler rejected event: {e}");

	if !emit_bridge_errors {
		return;
	}

	let Some(room_id) = event.room_id.clone() else {
		return;
	};

	let content = json!({
		"msgtype": BRIDGE_ERROR_EVENT_TYPE,
		"body": format!("The bridge failed to handle this event: {}", e.sanitized_message()),
		"reason": bridge_error_reason(&e),
		"affected_users": [event.sender],
		"relates_to_event": event.event_id,
	});

	if let Err(send_err) = services
		.intent
		.bot()
		.send_event(&room_id, "m.room.message", content)
		.await
	{
		debug_warn!(room = %room_id, "failed to signal bridge error: {send_err}");
	}
}

fn bridge_error_reason(error: &mxbridge_core::Error) -> &'static str {
	use mxbridge_core::Error;

	match error {
		| Error::EventNotHandled => "m.event_not_handled",
		| Error::EventTooOld => "m.event_too_old",
		| Error::ForeignNetworkError(..) => "m.foreign_network_error",
		| Error::EventUnknown => "m.event_unknown",
		| _ => "m.internal_error",
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use mxbridge_core::BridgeEvent;
	use ruma::{room_id, user_id};
	use serde_json::json;

	use crate::test_utils::{test_services, test_services_with};

	fn message(room: &str, sender: &str, eid: &str) -> BridgeEvent {
		serde_json::from_value(json!({
			"event_id": eid,
			"room_id": room,
			"sender": sender,
			"type": "m.room.message",
			"content": {"msgtype": "m.text", "body": "hello"},
		}))
		.unwrap()
	}

	async fn settle() {
		// dispatch queues hand off to spawned consumers
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	#[tokio::test]
	async fn transactions_deduplicate_by_id() {
		let harness = test_services().await;
		let appservice = &harness.services.services.appservice;

		let events =
			vec![message("!r:example.org", "@human:example.org", "$1:example.org")];

		appservice
			.handle_transaction("txn-1", events.clone(), Vec::new())
			.await
			.unwrap();
		appservice
			.handle_transaction("txn-1", events, Vec::new())
			.await
			.unwrap();
		settle().await;

		assert_eq!(harness.controller.events().len(), 1);
	}

	#[tokio::test]
	async fn ghost_echo_is_suppressed_but_state_still_tracked() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let room = room_id!("!echo:example.org");
		let ghost = user_id!("@remote_ghost:example.org");

		let member: BridgeEvent = serde_json::from_value(json!({
			"event_id": "$join:example.org",
			"room_id": room.as_str(),
			"sender": ghost.as_str(),
			"type": "m.room.member",
			"state_key": ghost.as_str(),
			"content": {"membership": "join"},
		}))
		.unwrap();

		services
			.appservice
			.handle_transaction("txn-echo", vec![member], Vec::new())
			.await
			.unwrap();
		settle().await;

		// no dispatch to the controller, but the cache saw the join
		assert!(harness.controller.events().is_empty());
		assert!(services.membership_cache.is_joined(room, ghost));
	}

	#[tokio::test]
	async fn per_room_queue_preserves_order() {
		let harness = test_services_with(|config| {
			config.event_queue = mxbridge_core::config::EventQueueFlavor::PerRoom;
		})
		.await;
		let appservice = &harness.services.services.appservice;

		let events: Vec<BridgeEvent> = (0..5)
			.map(|i| {
				message(
					"!ordered:example.org",
					"@human:example.org",
					&format!("$ord{i}:example.org"),
				)
			})
			.collect();

		appservice
			.handle_transaction("txn-ord", events, Vec::new())
			.await
			.unwrap();
		settle().await;

		let ids = harness.controller.event_ids();
		let expected: Vec<String> =
			(0..5).map(|i| format!("$ord{i}:example.org")).collect();
		assert_eq!(ids, expected);
	}

	#[tokio::test]
	async fn rejections_signal_bridge_errors_when_configured() {
		let harness = test_services_with(|config| {
			config.emit_bridge_errors = true;
		})
		.await;
		let appservice = &harness.services.services.appservice;

		harness
			.controller
			.fail_event
			.store(true, std::sync::atomic::Ordering::Relaxed);

		appservice
			.handle_transaction(
				"txn-err",
				vec![message("!sad:example.org", "@human:example.org", "$sad:example.org")],
				Vec::new(),
			)
			.await
			.unwrap();
		settle().await;

		let sent = harness.mock.sent();
		let error_event = sent
			.iter()
			.find(|s| s.content["msgtype"] == super::BRIDGE_ERROR_EVENT_TYPE)
			.expect("bridge error emitted");
		assert_eq!(error_event.content["reason"], "m.event_not_handled");
	}

	#[tokio::test]
	async fn banned_senders_are_dropped() {
		let harness = test_services_with(|config| {
			config.ban_sync = Some(
				serde_json::from_value(json!({"rooms": ["!policy:example.org"]})).unwrap(),
			);
		})
		.await;
		let services = &harness.services.services;

		services
			.ban_sync
			.handle_event(
				&serde_json::from_value(json!({
					"event_id": "$rule:example.org",
					"room_id": "!policy:example.org",
					"sender": "@mod:example.org",
					"type": "m.policy.rule.user",
					"state_key": "rule-1",
					"content": {"entity": "@banned:*", "recommendation": "m.ban"},
				}))
				.unwrap(),
			)
			.unwrap();

		services
			.appservice
			.handle_transaction(
				"txn-ban",
				vec![message("!r:example.org", "@banned:evil.org", "$evil:example.org")],
				Vec::new(),
			)
			.await
			.unwrap();
		settle().await;

		assert!(harness.controller.events().is_empty());
	}

	#[tokio::test]
	async fn ephemeral_respects_opt_in() {
		let harness = test_services().await;
		let appservice = &harness.services.services.appservice;

		let presence: BridgeEvent = serde_json::from_value(json!({
			"event_id": "$p:example.org",
			"sender": "@human:example.org",
			"type": "m.presence",
			"content": {"presence": "online"},
		}))
		.unwrap();

		appservice
			.handle_transaction("txn-eph1", Vec::new(), vec![presence.clone()])
			.await
			.unwrap();
		settle().await;
		assert!(harness.controller.ephemeral.lock().unwrap().is_empty());

		harness
			.controller
			.wants_ephemeral
			.store(true, std::sync::atomic::Ordering::Relaxed);

		appservice
			.handle_transaction("txn-eph2", Vec::new(), vec![presence])
			.await
			.unwrap();
		settle().await;
		assert_eq!(harness.controller.ephemeral.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn bridge_info_state_key_is_urlencoded() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let room = room_id!("!info:example.org");

		services
			.appservice
			.set_bridge_info(room, &super::BridgeInfo {
				bridge_name: "gitter".to_owned(),
				creator: Some(user_id!("@admin:example.org").to_owned()),
				protocol: super::BridgeInfoItem {
					id: "gitter".to_owned(),
					displayname: Some("Gitter".to_owned()),
					external_url: None,
				},
				network: None,
				channel: super::BridgeInfoItem {
					id: "my room/general".to_owned(),
					displayname: None,
					external_url: None,
				},
			})
			.await
			.unwrap();

		let state_key = "gitter:/gitter/my%20room%2Fgeneral";
		let content = harness
			.mock
			.sent_state(room, super::BRIDGE_INFO_STATE_TYPE, state_key)
			.expect("bridge info state sent");
		assert_eq!(content["bridgebot"], "@bridgebot:example.org");
		assert_eq!(content["protocol"]["id"], "gitter");
	}
}
