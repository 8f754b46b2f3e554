//! An in-memory homeserver for tests. Records every call, serves scripted
//! failures, and maintains just enough room/user state for the components'
//! invariants to be observable without a network.

use std::{
	collections::{BTreeMap, HashMap, HashSet, VecDeque},
	sync::{
		Mutex,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mxbridge_core::{BridgeEvent, Error, Profile, Result, err};
use ruma::{
	EventId, MxcUri, OwnedEventId, OwnedMxcUri, OwnedRoomAliasId, OwnedRoomId, OwnedServerName,
	OwnedUserId, RoomAliasId, RoomId, RoomOrAliasId, UserId,
};
use serde_json::Value as JsonValue;

use crate::{
	Homeserver,
	response::{MediaDownload, PresenceStatus, RegisterProbe, SyncResponse, WhoisInfo},
};

#[derive(Clone, Debug)]
pub struct SentEvent {
	pub room: OwnedRoomId,
	pub as_user: Option<OwnedUserId>,
	pub event_type: String,
	pub state_key: Option<String>,
	pub content: JsonValue,
	pub event_id: OwnedEventId,
}

pub struct MockHomeserver {
	bot: OwnedUserId,
	calls: Mutex<Vec<String>>,
	failures: Mutex<HashMap<String, VecDeque<Error>>>,

	registered: Mutex<HashSet<String>>,
	profiles: Mutex<HashMap<OwnedUserId, Profile>>,
	rooms: Mutex<HashMap<OwnedRoomId, BTreeMap<OwnedUserId, Profile>>>,
	aliases: Mutex<HashMap<OwnedRoomAliasId, OwnedRoomId>>,
	room_state: Mutex<HashMap<OwnedRoomId, Vec<BridgeEvent>>>,
	events: Mutex<HashMap<(OwnedRoomId, OwnedEventId), BridgeEvent>>,
	presence: Mutex<HashMap<OwnedUserId, PresenceStatus>>,
	whois: Mutex<HashMap<OwnedUserId, WhoisInfo>>,
	probes: Mutex<HashMap<String, RegisterProbe>>,
	media: Mutex<HashMap<String, (Option<String>, Bytes)>>,
	sync_queue: Mutex<VecDeque<SyncResponse>>,

	sent: Mutex<Vec<SentEvent>>,
	admin_api: AtomicBool,
	counter: AtomicU64,
}

impl Default for MockHomeserver {
	fn default() -> Self { Self::new() }
}

impl MockHomeserver {
	#[must_use]
	pub fn new() -> Self {
		Self {
			bot: ruma::user_id!("@bridgebot:example.org").to_owned(),
			calls: Mutex::default(),
			failures: Mutex::default(),
			registered: Mutex::default(),
			profiles: Mutex::default(),
			rooms: Mutex::default(),
			aliases: Mutex::default(),
			room_state: Mutex::default(),
			events: Mutex::default(),
			presence: Mutex::default(),
			whois: Mutex::default(),
			probes: Mutex::default(),
			media: Mutex::default(),
			sync_queue: Mutex::default(),
			sent: Mutex::default(),
			admin_api: AtomicBool::new(false),
			counter: AtomicU64::new(0),
		}
	}

	#[must_use]
	pub fn with_bot(mut self, bot: OwnedUserId) -> Self {
		self.bot = bot;
		self
	}

	fn effective<'a>(&'a self, as_user: Option<&'a UserId>) -> &'a UserId {
		as_user.unwrap_or(&self.bot)
	}

	fn label(as_user: Option<&UserId>) -> &str {
		as_user.map_or("bot", UserId::as_str)
	}

	fn next(&self) -> u64 { self.counter.fetch_add(1, Ordering::Relaxed) }

	fn next_event_id(&self) -> OwnedEventId {
		EventId::parse(format!("$mock{}:example.org", self.next()))
			.expect("synthesized event id parses")
	}

	/// Record a call and serve a scripted failure if one is queued for the
	/// exact call string or for the op name alone.
	fn take(&self, call: String) -> Result<()> {
		self.calls
			.lock()
			.expect("mock lock")
			.push(call.clone());

		let mut failures = self.failures.lock().expect("mock lock");
		let op = call
			.split_whitespace()
			.next()
			.unwrap_or_default()
			.to_owned();

		for key in [call, op] {
			if let Some(queue) = failures.get_mut(&key) {
				if let Some(error) = queue.pop_front() {
					return Err(error);
				}
			}
		}

		Ok(())
	}

	// --- scripting -----------------------------------------------------

	/// Queue an error for the next matching call. `key` is either a full
	/// call string (e.g. `"join !r:example.org @u:example.org"`) or a bare
	/// op name (`"join"`).
	pub fn fail_next(&self, key: &str, error: Error) {
		self.failures
			.lock()
			.expect("mock lock")
			.entry(key.to_owned())
			.or_default()
			.push_back(error);
	}

	pub fn set_joined(&self, room: &RoomId, user: &UserId, profile: Profile) {
		self.rooms
			.lock()
			.expect("mock lock")
			.entry(room.to_owned())
			.or_default()
			.insert(user.to_owned(), profile);
	}

	pub fn set_alias(&self, alias: &RoomAliasId, room: &RoomId) {
		self.aliases
			.lock()
			.expect("mock lock")
			.insert(alias.to_owned(), room.to_owned());
	}

	pub fn put_state(&self, event: BridgeEvent) {
		let room = event
			.room_id
			.clone()
			.expect("state event carries room id");

		let mut state = self.room_state.lock().expect("mock lock");
		let events = state.entry(room).or_default();
		events.retain(|e| (&e.kind, &e.state_key) != (&event.kind, &event.state_key));
		events.push(event);
	}

	pub fn put_event(&self, event: BridgeEvent) {
		let room = event
			.room_id
			.clone()
			.expect("stored event carries room id");

		self.events
			.lock()
			.expect("mock lock")
			.insert((room, event.event_id.clone()), event);
	}

	pub fn set_profile(&self, user: &UserId, profile: Profile) {
		self.profiles
			.lock()
			.expect("mock lock")
			.insert(user.to_owned(), profile);
	}

	pub fn set_presence_status(&self, user: &UserId, status: PresenceStatus) {
		self.presence
			.lock()
			.expect("mock lock")
			.insert(user.to_owned(), status);
	}

	pub fn set_whois(&self, user: &UserId, info: WhoisInfo) {
		self.whois
			.lock()
			.expect("mock lock")
			.insert(user.to_owned(), info);
	}

	pub fn set_admin_api(&self, reachable: bool) {
		self.admin_api.store(reachable, Ordering::Relaxed);
	}

	pub fn set_probe(&self, host: &str, status: u16, body: JsonValue) {
		self.probes
			.lock()
			.expect("mock lock")
			.insert(host.to_owned(), RegisterProbe { status, body });
	}

	pub fn put_media(&self, mxc: &str, content_type: Option<&str>, bytes: Bytes) {
		self.media
			.lock()
			.expect("mock lock")
			.insert(mxc.to_owned(), (content_type.map(ToOwned::to_owned), bytes));
	}

	pub fn push_sync(&self, response: SyncResponse) {
		self.sync_queue
			.lock()
			.expect("mock lock")
			.push_back(response);
	}

	// --- inspection ----------------------------------------------------

	#[must_use]
	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().expect("mock lock").clone()
	}

	#[must_use]
	pub fn call_count(&self, op: &str) -> usize {
		self.calls
			.lock()
			.expect("mock lock")
			.iter()
			.filter(|call| call.split_whitespace().next() == Some(op))
			.count()
	}

	#[must_use]
	pub fn sent(&self) -> Vec<SentEvent> {
		self.sent.lock().expect("mock lock").clone()
	}

	#[must_use]
	pub fn sent_state(
		&self,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
	) -> Option<JsonValue> {
		self.sent
			.lock()
			.expect("mock lock")
			.iter()
			.rev()
			.find(|sent| {
				sent.room == room
					&& sent.event_type == event_type
					&& sent.state_key.as_deref() == Some(state_key)
			})
			.map(|sent| sent.content.clone())
	}

	#[must_use]
	pub fn is_joined(&self, room: &RoomId, user: &UserId) -> bool {
		self.rooms
			.lock()
			.expect("mock lock")
			.get(room)
			.is_some_and(|members| members.contains_key(user))
	}

	#[must_use]
	pub fn is_registered(&self, localpart: &str) -> bool {
		self.registered
			.lock()
			.expect("mock lock")
			.contains(localpart)
	}
}

#[async_trait]
impl Homeserver for MockHomeserver {
	async fn register_user(&self, localpart: &str) -> Result<()> {
		self.take(format!("register {localpart}"))?;
		self.registered
			.lock()
			.expect("mock lock")
			.insert(localpart.to_owned());
		Ok(())
	}

	async fn join_room(
		&self,
		as_user: Option<&UserId>,
		room: &RoomOrAliasId,
		_via: &[OwnedServerName],
	) -> Result<OwnedRoomId> {
		self.take(format!("join {room} {}", Self::label(as_user)))?;

		let room_id = if room.is_room_id() {
			RoomId::parse(room.as_str())?
		} else {
			let alias = RoomAliasId::parse(room.as_str())?;
			self.aliases
				.lock()
				.expect("mock lock")
				.get(&alias)
				.cloned()
				.ok_or_else(|| err!(NotFound("unknown alias {alias}")))?
		};

		let user = self.effective(as_user).to_owned();
		self.set_joined(&room_id, &user, Profile::default());
		Ok(room_id)
	}

	async fn leave_room(&self, as_user: Option<&UserId>, room: &RoomId) -> Result<()> {
		self.take(format!("leave {room} {}", Self::label(as_user)))?;
		let user = self.effective(as_user).to_owned();
		if let Some(members) = self.rooms.lock().expect("mock lock").get_mut(room) {
			members.remove(&user);
		}
		Ok(())
	}

	async fn invite_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
	) -> Result<()> {
		self.take(format!("invite {room} {target} {}", Self::label(as_user)))
	}

	async fn kick_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
		_reason: Option<&str>,
	) -> Result<()> {
		self.take(format!("kick {room} {target} {}", Self::label(as_user)))?;
		if let Some(members) = self.rooms.lock().expect("mock lock").get_mut(room) {
			members.remove(target);
		}
		Ok(())
	}

	async fn ban_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
		_reason: Option<&str>,
	) -> Result<()> {
		self.take(format!("ban {room} {target} {}", Self::label(as_user)))?;
		if let Some(members) = self.rooms.lock().expect("mock lock").get_mut(room) {
			members.remove(target);
		}
		Ok(())
	}

	async fn unban_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
	) -> Result<()> {
		self.take(format!("unban {room} {target} {}", Self::label(as_user)))
	}

	async fn joined_members(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
	) -> Result<BTreeMap<OwnedUserId, Profile>> {
		self.take(format!("joined_members {room} {}", Self::label(as_user)))?;
		Ok(self
			.rooms
			.lock()
			.expect("mock lock")
			.get(room)
			.cloned()
			.unwrap_or_default())
	}

	async fn resolve_alias(&self, alias: &RoomAliasId) -> Result<OwnedRoomId> {
		self.take(format!("resolve_alias {alias}"))?;
		self.aliases
			.lock()
			.expect("mock lock")
			.get(alias)
			.cloned()
			.ok_or_else(|| err!(NotFound("unknown alias {alias}")))
	}

	async fn create_room(
		&self,
		as_user: Option<&UserId>,
		options: JsonValue,
	) -> Result<OwnedRoomId> {
		self.take(format!("create_room {}", Self::label(as_user)))?;

		let room_id = RoomId::parse(format!("!mock{}:example.org", self.next()))?;
		let creator = self.effective(as_user).to_owned();
		self.set_joined(&room_id, &creator, Profile::default());

		drop(options);
		Ok(room_id)
	}

	async fn send_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		content: JsonValue,
	) -> Result<OwnedEventId> {
		self.take(format!("send {room} {event_type} {}", Self::label(as_user)))?;

		let event_id = self.next_event_id();
		self.sent.lock().expect("mock lock").push(SentEvent {
			room: room.to_owned(),
			as_user: as_user.map(ToOwned::to_owned),
			event_type: event_type.to_owned(),
			state_key: None,
			content,
			event_id: event_id.clone(),
		});

		Ok(event_id)
	}

	async fn send_state_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
		content: JsonValue,
	) -> Result<OwnedEventId> {
		self.take(format!(
			"send_state {room} {event_type} {state_key} {}",
			Self::label(as_user)
		))?;

		let event_id = self.next_event_id();
		self.sent.lock().expect("mock lock").push(SentEvent {
			room: room.to_owned(),
			as_user: as_user.map(ToOwned::to_owned),
			event_type: event_type.to_owned(),
			state_key: Some(state_key.to_owned()),
			content: content.clone(),
			event_id: event_id.clone(),
		});

		self.put_state(BridgeEvent {
			event_id: event_id.clone(),
			room_id: Some(room.to_owned()),
			sender: self.effective(as_user).to_owned(),
			kind: event_type.to_owned(),
			state_key: Some(state_key.to_owned()),
			content,
			origin_server_ts: None,
			unsigned: None,
		});

		Ok(event_id)
	}

	async fn room_state(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
	) -> Result<Vec<BridgeEvent>> {
		self.take(format!("room_state {room} {}", Self::label(as_user)))?;
		Ok(self
			.room_state
			.lock()
			.expect("mock lock")
			.get(room)
			.cloned()
			.unwrap_or_default())
	}

	async fn state_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
	) -> Result<JsonValue> {
		self.take(format!(
			"state {room} {event_type} {state_key} {}",
			Self::label(as_user)
		))?;

		self.room_state
			.lock()
			.expect("mock lock")
			.get(room)
			.and_then(|events| {
				events.iter().find(|e| {
					e.kind == event_type && e.state_key.as_deref() == Some(state_key)
				})
			})
			.map(|e| e.content.clone())
			.ok_or_else(|| err!(NotFound("no state {event_type}/{state_key} in {room}")))
	}

	async fn event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_id: &EventId,
	) -> Result<BridgeEvent> {
		self.take(format!("event {room} {event_id} {}", Self::label(as_user)))?;
		self.events
			.lock()
			.expect("mock lock")
			.get(&(room.to_owned(), event_id.to_owned()))
			.cloned()
			.ok_or_else(|| err!(NotFound("no event {event_id} in {room}")))
	}

	async fn profile(&self, as_user: Option<&UserId>, user: &UserId) -> Result<Profile> {
		self.take(format!("profile {user} {}", Self::label(as_user)))?;
		Ok(self
			.profiles
			.lock()
			.expect("mock lock")
			.get(user)
			.cloned()
			.unwrap_or_default())
	}

	async fn set_displayname(&self, as_user: Option<&UserId>, displayname: &str) -> Result<()> {
		self.take(format!("set_displayname {} {displayname}", Self::label(as_user)))?;
		let user = self.effective(as_user).to_owned();
		self.profiles
			.lock()
			.expect("mock lock")
			.entry(user)
			.or_default()
			.displayname = Some(displayname.to_owned());
		Ok(())
	}

	async fn set_avatar_url(&self, as_user: Option<&UserId>, avatar_url: &MxcUri) -> Result<()> {
		self.take(format!("set_avatar_url {} {avatar_url}", Self::label(as_user)))?;
		let user = self.effective(as_user).to_owned();
		self.profiles
			.lock()
			.expect("mock lock")
			.entry(user)
			.or_default()
			.avatar_url = Some(avatar_url.to_owned());
		Ok(())
	}

	async fn set_presence(
		&self,
		as_user: Option<&UserId>,
		presence: &str,
		_status_msg: Option<&str>,
	) -> Result<()> {
		self.take(format!("set_presence {} {presence}", Self::label(as_user)))
	}

	async fn presence(&self, user: &UserId) -> Result<PresenceStatus> {
		self.take(format!("presence {user}"))?;
		self.presence
			.lock()
			.expect("mock lock")
			.get(user)
			.cloned()
			.ok_or_else(|| err!(NotFound("no presence for {user}")))
	}

	async fn send_typing(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		typing: bool,
		_timeout_ms: u64,
	) -> Result<()> {
		self.take(format!("typing {room} {typing} {}", Self::label(as_user)))
	}

	async fn send_read_receipt(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_id: &EventId,
	) -> Result<()> {
		self.take(format!("read_receipt {room} {event_id} {}", Self::label(as_user)))
	}

	async fn create_alias(
		&self,
		as_user: Option<&UserId>,
		alias: &RoomAliasId,
		room: &RoomId,
	) -> Result<()> {
		self.take(format!("create_alias {alias} {room} {}", Self::label(as_user)))?;
		self.set_alias(alias, room);
		Ok(())
	}

	async fn upload(
		&self,
		as_user: Option<&UserId>,
		bytes: Bytes,
		_content_type: Option<&str>,
		_filename: Option<&str>,
	) -> Result<OwnedMxcUri> {
		self.take(format!("upload {} {}", Self::label(as_user), bytes.len()))?;
		Ok(OwnedMxcUri::from(
			format!("mxc://example.org/mock{}", self.next()).as_str(),
		))
	}

	async fn set_room_directory_visibility(&self, room: &RoomId, visible: bool) -> Result<()> {
		self.take(format!("directory_visibility {room} {visible}"))
	}

	async fn set_network_room_visibility(
		&self,
		network_id: &str,
		room: &RoomId,
		visible: bool,
	) -> Result<()> {
		self.take(format!("network_visibility {network_id} {room} {visible}"))
	}

	async fn whois(&self, user: &UserId) -> Result<WhoisInfo> {
		self.take(format!("whois {user}"))?;
		self.whois
			.lock()
			.expect("mock lock")
			.get(user)
			.cloned()
			.ok_or_else(|| err!(NotFound("no whois for {user}")))
	}

	async fn admin_probe(&self) -> Result<bool> {
		self.take("admin_probe".to_owned())?;
		Ok(self.admin_api.load(Ordering::Relaxed))
	}

	async fn sync(
		&self,
		as_user: &UserId,
		_filter: &JsonValue,
		_since: Option<&str>,
		_timeout_ms: u64,
	) -> Result<SyncResponse> {
		self.take(format!("sync {as_user}"))?;

		let queued = self
			.sync_queue
			.lock()
			.expect("mock lock")
			.pop_front();

		match queued {
			| Some(response) => Ok(response),
			| None => {
				// simulate a long-poll returning empty so pumps don't spin
				tokio::time::sleep(std::time::Duration::from_millis(25)).await;
				Ok(SyncResponse {
					next_batch: format!("s{}", self.next()),
					..SyncResponse::default()
				})
			},
		}
	}

	async fn probe_registration(&self, host: &str) -> Result<RegisterProbe> {
		self.take(format!("probe {host}"))?;
		Ok(self
			.probes
			.lock()
			.expect("mock lock")
			.get(host)
			.cloned()
			.unwrap_or(RegisterProbe { status: 404, body: JsonValue::Null }))
	}

	async fn download(
		&self,
		mxc: &MxcUri,
		_content_token: Option<&str>,
	) -> Result<MediaDownload> {
		self.take(format!("download {mxc}"))?;

		let (content_type, bytes) = self
			.media
			.lock()
			.expect("mock lock")
			.get(mxc.as_str())
			.cloned()
			.ok_or_else(|| err!(NotFound("no media {mxc}")))?;

		Ok(MediaDownload {
			content_type,
			content_length: Some(bytes.len() as u64),
			content_disposition: None,
			stream: futures::stream::once(async move { Ok(bytes) }).boxed(),
		})
	}
}
