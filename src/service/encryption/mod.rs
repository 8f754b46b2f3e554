//! Encrypted-event brokering. For each encrypted room exactly one virtual
//! user runs a decrypting sync; events seen on both the appservice stream
//! (ciphertext) and the sync stream (plaintext) are reconciled so the
//! bridge sees each event at most once, in decrypted form.

mod pump;

use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::{Arc, Mutex, RwLock, atomic::Ordering},
	time::Duration,
};

use async_trait::async_trait;
use mxbridge_core::{
	BridgeEvent, Result, debug, err, info, utils::millis_since_unix_epoch, warn,
};
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};

use crate::services::OnceServices;

const PRESENCE_WINDOW_MS: u64 = 30 * 1000;
const PRESENCE_SWEEP: Duration = Duration::from_secs(30);

struct PumpHandle {
	wake: loole::Sender<()>,
	abort: tokio::task::AbortHandle,
}

pub struct Service {
	enabled: bool,

	/// Which virtual user owns the decrypting sync for each room.
	user_for_room: RwLock<HashMap<OwnedRoomId, OwnedUserId>>,

	/// Event ids seen via the appservice, awaiting their sync counterpart.
	pending_sync: Mutex<HashSet<OwnedEventId>>,

	/// Decrypted events seen via sync, awaiting their appservice
	/// counterpart.
	pending_as: Mutex<HashMap<OwnedEventId, BridgeEvent>>,

	/// `room:event` pairs already delivered; first come, first served.
	handled: Mutex<HashSet<String>>,

	pumps: Mutex<HashMap<OwnedUserId, PumpHandle>>,

	presence_seen: Mutex<(VecDeque<(u64, String)>, HashSet<String>)>,

	services: Arc<OnceServices>,
}

#[async_trait]
impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			enabled: args.server.config.get().encryption.is_some(),
			user_for_room: RwLock::new(HashMap::new()),
			pending_sync: Mutex::new(HashSet::new()),
			pending_as: Mutex::new(HashMap::new()),
			handled: Mutex::new(HashSet::new()),
			pumps: Mutex::new(HashMap::new()),
			presence_seen: Mutex::new((VecDeque::new(), HashSet::new())),
			services: args.services.clone(),
		}))
	}

	/// Presence-window sweeper.
	async fn worker(self: Arc<Self>) -> Result {
		loop {
			tokio::select! {
				() = self.services.server.until_shutdown() => break,
				() = tokio::time::sleep(PRESENCE_SWEEP) => self.sweep_presence(),
			}
		}

		Ok(())
	}

	async fn interrupt(&self) {
		let pumps = {
			let mut pumps = self.pumps.lock().expect("pump lock");
			std::mem::take(&mut *pumps)
		};

		for (user, pump) in pumps {
			debug!(%user, "stopping encrypted sync pump");
			pump.abort.abort();
		}
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	#[inline]
	#[must_use]
	pub fn is_enabled(&self) -> bool { self.enabled }

	/// An encrypted event arrived on the appservice stream. Returns the
	/// decrypted event to dispatch when its sync counterpart already
	/// landed; otherwise the sync side will deliver later.
	pub async fn on_as_event(&self, event: &BridgeEvent) -> Result<Option<BridgeEvent>> {
		let room_id = event.require_room()?.to_owned();

		if let Some(owner) = self.owner_of(&room_id) {
			self.wake(&owner);
		} else {
			self.elect_owner(&room_id).await?;
		}

		let handled_key = handled_key(&room_id, &event.event_id);
		if self
			.handled
			.lock()
			.expect("handled lock")
			.contains(&handled_key)
		{
			return Ok(None);
		}

		let counterpart = self
			.pending_as
			.lock()
			.expect("pending lock")
			.remove(&event.event_id);

		if let Some(decrypted) = counterpart {
			return Ok(self.mark_delivered(&decrypted).then_some(decrypted));
		}

		self.pending_sync
			.lock()
			.expect("pending lock")
			.insert(event.event_id.clone());

		Ok(None)
	}

	/// A decrypted event arrived from an owning user's sync. Returns it
	/// when both sides have now been seen and it was not delivered before.
	pub fn on_sync_event(&self, event: BridgeEvent) -> Option<BridgeEvent> {
		let room_id = event.room_id.clone()?;

		let handled_key = handled_key(&room_id, &event.event_id);
		if self
			.handled
			.lock()
			.expect("handled lock")
			.contains(&handled_key)
		{
			self.services
				.server
				.metrics
				.encrypted_deduplicated
				.fetch_add(1, Ordering::Relaxed);
			return None;
		}

		let seen_via_as = self
			.pending_sync
			.lock()
			.expect("pending lock")
			.remove(&event.event_id);

		if seen_via_as {
			return self.mark_delivered(&event).then_some(event);
		}

		self.pending_as
			.lock()
			.expect("pending lock")
			.insert(event.event_id.clone(), event);

		None
	}

	fn mark_delivered(&self, event: &BridgeEvent) -> bool {
		let Some(room_id) = event.room_id.as_deref() else {
			return false;
		};

		let fresh = self
			.handled
			.lock()
			.expect("handled lock")
			.insert(handled_key(room_id, &event.event_id));

		if fresh {
			self.services
				.server
				.metrics
				.encrypted_delivered
				.fetch_add(1, Ordering::Relaxed);
		} else {
			self.services
				.server
				.metrics
				.encrypted_deduplicated
				.fetch_add(1, Ordering::Relaxed);
		}

		fresh
	}

	#[must_use]
	pub fn owner_of(&self, room_id: &RoomId) -> Option<OwnedUserId> {
		self.user_for_room
			.read()
			.expect("owner lock")
			.get(room_id)
			.cloned()
	}

	/// Whether this user owns any room's sync (and so must not be culled).
	#[must_use]
	pub fn protects(&self, user_id: &UserId) -> bool {
		self.user_for_room
			.read()
			.expect("owner lock")
			.values()
			.any(|owner| owner == user_id)
	}

	/// Pick a virtual member of the room to own its decrypting sync. A user
	/// already owning some room is preferred, so sync sessions concentrate.
	async fn elect_owner(&self, room_id: &RoomId) -> Result<OwnedUserId> {
		let members = self.joined_members(room_id).await?;
		let ghosts: Vec<OwnedUserId> = members
			.into_iter()
			.filter(|user| self.services.globals.is_virtual_user(user))
			.collect();

		if ghosts.is_empty() {
			return Err(err!("no virtual user joined to encrypted room {room_id}"));
		}

		let owner = {
			let owners = self.user_for_room.read().expect("owner lock");
			ghosts
				.iter()
				.find(|ghost| owners.values().any(|owner| owner == *ghost))
				.unwrap_or(&ghosts[0])
				.clone()
		};

		self.services
			.intent
			.get(&owner)
			.ensure_registered()
			.await?;

		self.user_for_room
			.write()
			.expect("owner lock")
			.insert(room_id.to_owned(), owner.clone());

		info!(room = %room_id, user = %owner, "elected encrypted-sync owner");
		self.start_pump(&owner);
		Ok(owner)
	}

	async fn joined_members(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>> {
		if let Some(members) = self
			.services
			.membership_cache
			.joined_members(room_id)
		{
			if !members.is_empty() {
				return Ok(members);
			}
		}

		let fetched = self
			.services
			.client
			.joined_members(None, room_id)
			.await?;

		let members: Vec<_> = fetched.into_iter().collect();
		self.services
			.membership_cache
			.populate_joined(room_id, &members);

		Ok(members.into_iter().map(|(user, _)| user).collect())
	}

	fn start_pump(&self, user_id: &UserId) {
		let mut pumps = self.pumps.lock().expect("pump lock");
		if pumps.contains_key(user_id) {
			return;
		}

		let (wake_tx, wake_rx) = loole::bounded(1);
		let task = pump::run(self.services.clone(), user_id.to_owned(), wake_rx);
		let abort = self
			.services
			.server
			.runtime()
			.spawn(task)
			.abort_handle();

		pumps.insert(user_id.to_owned(), PumpHandle { wake: wake_tx, abort });
	}

	fn wake(&self, user_id: &UserId) {
		let pumps = self.pumps.lock().expect("pump lock");
		if let Some(pump) = pumps.get(user_id) {
			// a full channel means a wake is already pending
			pump.wake.try_send(()).ok();
		} else {
			drop(pumps);
			warn!(%user_id, "owner had no running pump, restarting");
			self.start_pump(user_id);
		}
	}

	/// Stop a user's sync pump (cull path; the user owns no rooms).
	pub async fn stop_sync_for(&self, user_id: &UserId) {
		let pump = self
			.pumps
			.lock()
			.expect("pump lock")
			.remove(user_id);

		if let Some(pump) = pump {
			debug!(%user_id, "stopping encrypted sync pump");
			pump.abort.abort();
		}
	}

	#[must_use]
	pub fn pump_count(&self) -> usize {
		self.pumps.lock().expect("pump lock").len()
	}

	// --- ephemeral dedup ----------------------------------------------

	/// Sliding-window dedup for presence from the sync stream. True when
	/// the event should be passed on.
	pub fn should_deliver_presence(&self, event: &BridgeEvent) -> bool {
		let key = format!(
			"{}|{}|{}|{}",
			event.sender,
			event
				.content
				.get("presence")
				.and_then(serde_json::Value::as_str)
				.unwrap_or_default(),
			event
				.content
				.get("currently_active")
				.and_then(serde_json::Value::as_bool)
				.unwrap_or_default(),
			event
				.content
				.get("status_msg")
				.and_then(serde_json::Value::as_str)
				.unwrap_or_default(),
		);

		let mut seen = self.presence_seen.lock().expect("presence lock");
		let now = millis_since_unix_epoch();
		while let Some((expiry, _)) = seen.0.front() {
			if *expiry > now {
				break;
			}
			let (_, expired_key) = seen.0.pop_front().expect("non-empty after peek");
			seen.1.remove(&expired_key);
		}

		if seen.1.contains(&key) {
			return false;
		}

		seen.0
			.push_back((now.saturating_add(PRESENCE_WINDOW_MS), key.clone()));
		seen.1.insert(key);
		true
	}

	fn sweep_presence(&self) {
		let mut seen = self.presence_seen.lock().expect("presence lock");
		let now = millis_since_unix_epoch();
		while let Some((expiry, _)) = seen.0.front() {
			if *expiry > now {
				break;
			}
			let (_, key) = seen.0.pop_front().expect("non-empty after peek");
			seen.1.remove(&key);
		}
	}
}

fn handled_key(room_id: &RoomId, event_id: &ruma::EventId) -> String {
	format!("{room_id}:{event_id}")
}
