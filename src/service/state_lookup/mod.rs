//! Eventually-consistent projection of selected room state. The first
//! `track_room` triggers a bounded-concurrency `/state` fetch; live events
//! strictly supersede fetched state, last write wins.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex, RwLock},
	time::Duration,
};

use async_trait::async_trait;
use mxbridge_core::{BridgeEvent, Result, debug, debug_warn, utils::Defer, warn};
use ruma::{OwnedRoomId, RoomId};
use tokio::sync::Semaphore;

use crate::services::OnceServices;

const DEFAULT_TRACKED_TYPES: &[&str] =
	&["m.room.member", "m.room.power_levels", "m.room.tombstone"];

struct RoomState {
	events: RwLock<HashMap<String, HashMap<String, BridgeEvent>>>,
	/// Resolves `true` once the initial fetch landed, `false` on permanent
	/// failure.
	synced: Defer<bool>,
}

pub struct Service {
	rooms: Mutex<HashMap<OwnedRoomId, Arc<RoomState>>>,
	tracked_types: RwLock<HashSet<String>>,
	fetch_limit: Arc<Semaphore>,
	retry_ms: u64,
	services: Arc<OnceServices>,
}

#[async_trait]
impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		let config = args.server.config.get();

		Ok(Arc::new(Self {
			rooms: Mutex::new(HashMap::new()),
			tracked_types: RwLock::new(
				DEFAULT_TRACKED_TYPES
					.iter()
					.map(|&s| s.to_owned())
					.collect(),
			),
			fetch_limit: Arc::new(Semaphore::new(config.state_lookup_concurrency)),
			retry_ms: config.state_retry_ms,
			services: args.services.clone(),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	/// Replace the set of state event types this lookup follows.
	pub fn track_types<I: IntoIterator<Item = String>>(&self, types: I) {
		*self.tracked_types.write().expect("state lock") = types.into_iter().collect();
	}

	fn is_tracked_type(&self, event_type: &str) -> bool {
		self.tracked_types
			.read()
			.expect("state lock")
			.contains(event_type)
	}

	/// Idempotent: the first call for a room performs the initial `/state`
	/// fetch (bounded by the configured concurrency); later calls await the
	/// same sync.
	pub async fn track_room(&self, room_id: &RoomId) -> Result {
		let (state, fetcher) = {
			let mut rooms = self.rooms.lock().expect("state lock");
			match rooms.get(room_id) {
				| Some(state) => (state.clone(), false),
				| None => {
					let state = Arc::new(RoomState {
						events: RwLock::new(HashMap::new()),
						synced: Defer::new(),
					});
					rooms.insert(room_id.to_owned(), state.clone());
					(state, true)
				},
			}
		};

		if !fetcher {
			return match state.synced.wait().await {
				| Some(true) => Ok(()),
				| _ => Err(mxbridge_core::err!("initial state sync failed for {room_id}")),
			};
		}

		self.initial_sync(room_id, &state).await
	}

	async fn initial_sync(&self, room_id: &RoomId, state: &Arc<RoomState>) -> Result {
		loop {
			let _permit = self
				.fetch_limit
				.acquire()
				.await
				.expect("semaphore never closed");

			let fetched = self
				.services
				.intent
				.bot()
				.room_state(room_id, false)
				.await;

			match fetched {
				| Ok(events) => {
					let mut map = state.events.write().expect("state lock");
					for event in events {
						let Some(state_key) = event.state_key.clone() else {
							continue;
						};
						if !self.is_tracked_type(&event.kind) {
							continue;
						}

						// live updates may already have landed; they win
						map.entry(event.kind.clone())
							.or_default()
							.entry(state_key)
							.or_insert(event);
					}
					drop(map);

					debug!(room = %room_id, "initial state sync complete");
					state.synced.resolve(true);
					return Ok(());
				},
				| Err(e) if is_permanent_sync_failure(&e) => {
					warn!(room = %room_id, "initial state sync failed permanently: {e}");
					state.synced.resolve(false);
					self.rooms
						.lock()
						.expect("state lock")
						.remove(room_id);
					return Err(e);
				},
				| Err(e) => {
					debug_warn!(room = %room_id, "state fetch failed, retrying: {e}");
				},
			}

			drop(_permit);
			tokio::time::sleep(Duration::from_millis(self.retry_ms)).await;

			if !self.services.server.running() {
				state.synced.resolve(false);
				return Err(mxbridge_core::err!("shutdown during initial state sync"));
			}
		}
	}

	/// Blunt last-write-wins update from the live event stream. Awaits any
	/// in-flight initial sync for the room first.
	pub async fn on_event(&self, event: &BridgeEvent) {
		let Some(room_id) = event.room_id.as_deref() else {
			return;
		};

		let state = {
			let rooms = self.rooms.lock().expect("state lock");
			rooms.get(room_id).cloned()
		};
		let Some(state) = state else {
			return;
		};

		state.synced.wait().await;

		let Some(state_key) = event.state_key.clone() else {
			return;
		};
		if !self.is_tracked_type(&event.kind) || !event.content.is_object() {
			return;
		}

		state
			.events
			.write()
			.expect("state lock")
			.entry(event.kind.clone())
			.or_default()
			.insert(state_key, event.clone());
	}

	#[must_use]
	pub fn get_state(
		&self,
		room_id: &RoomId,
		event_type: &str,
		state_key: Option<&str>,
	) -> Vec<BridgeEvent> {
		let state = {
			let rooms = self.rooms.lock().expect("state lock");
			rooms.get(room_id).cloned()
		};
		let Some(state) = state else {
			return Vec::new();
		};

		let events = state.events.read().expect("state lock");
		let Some(by_key) = events.get(event_type) else {
			return Vec::new();
		};

		match state_key {
			| Some(key) => by_key.get(key).cloned().into_iter().collect(),
			| None => by_key.values().cloned().collect(),
		}
	}

	#[must_use]
	pub fn get_state_event(
		&self,
		room_id: &RoomId,
		event_type: &str,
		state_key: &str,
	) -> Option<BridgeEvent> {
		self.get_state(room_id, event_type, Some(state_key))
			.into_iter()
			.next()
	}

	#[must_use]
	pub fn is_tracking(&self, room_id: &RoomId) -> bool {
		self.rooms
			.lock()
			.expect("state lock")
			.contains_key(room_id)
	}
}

/// A room we could not even join, or a definite homeserver refusal (4xx/5xx
/// response), will not be fixed by retrying. Transport-level failures are
/// retried indefinitely.
fn is_permanent_sync_failure(error: &mxbridge_core::Error) -> bool {
	use mxbridge_core::Error;

	if error.to_string().contains("Failed to join room") {
		return true;
	}

	match error {
		| Error::Forbidden(..)
		| Error::NotFound(..)
		| Error::UserInUse(..)
		| Error::Exclusive(..)
		| Error::RateLimited { .. } => true,
		| Error::Matrix { status, .. } => status.as_u16() >= 400,
		| _ => false,
	}
}

#[cfg(test)]
mod tests {
	use mxbridge_core::err;
	use ruma::{room_id, user_id};
	use serde_json::json;

	use crate::test_utils::test_services;

	fn member_event(room: &str, user: &str, membership: &str, eid: &str) -> serde_json::Value {
		json!({
			"event_id": eid,
			"room_id": room,
			"sender": user,
			"type": "m.room.member",
			"state_key": user,
			"content": {"membership": membership},
		})
	}

	#[tokio::test]
	async fn track_room_is_idempotent() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let room = room_id!("!tracked:example.org");

		harness.mock.put_state(
			serde_json::from_value(member_event(
				room.as_str(),
				"@remote_a:example.org",
				"join",
				"$s1:example.org",
			))
			.unwrap(),
		);

		services.state_lookup.track_room(room).await.unwrap();
		services.state_lookup.track_room(room).await.unwrap();

		assert_eq!(harness.mock.call_count("room_state"), 1);

		let members = services
			.state_lookup
			.get_state(room, "m.room.member", None);
		assert_eq!(members.len(), 1);
	}

	#[tokio::test]
	async fn live_events_supersede_fetched_state() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let room = room_id!("!lww:example.org");
		let user = user_id!("@remote_b:example.org");

		harness.mock.put_state(
			serde_json::from_value(member_event(
				room.as_str(),
				user.as_str(),
				"join",
				"$old:example.org",
			))
			.unwrap(),
		);

		services.state_lookup.track_room(room).await.unwrap();

		services
			.state_lookup
			.on_event(
				&serde_json::from_value(member_event(
					room.as_str(),
					user.as_str(),
					"leave",
					"$new:example.org",
				))
				.unwrap(),
			)
			.await;

		let event = services
			.state_lookup
			.get_state_event(room, "m.room.member", user.as_str())
			.unwrap();
		assert_eq!(event.event_id.as_str(), "$new:example.org");
		assert_eq!(event.content["membership"], "leave");
	}

	#[tokio::test]
	async fn untracked_rooms_ignore_events() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let room = room_id!("!ignored:example.org");

		services
			.state_lookup
			.on_event(
				&serde_json::from_value(member_event(
					room.as_str(),
					"@remote_c:example.org",
					"join",
					"$x:example.org",
				))
				.unwrap(),
			)
			.await;

		assert!(services
			.state_lookup
			.get_state(room, "m.room.member", None)
			.is_empty());
		drop(harness);
	}

	#[tokio::test]
	async fn permanent_fetch_failures_reject() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let room = room_id!("!forbidden:example.org");

		harness
			.mock
			.fail_next("room_state", err!(Request(Forbidden("no peeking"))));

		assert!(services.state_lookup.track_room(room).await.is_err());
		assert!(!services.state_lookup.is_tracking(room));
	}
}
