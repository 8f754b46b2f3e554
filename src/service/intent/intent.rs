use std::{
	collections::HashMap,
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	time::Duration,
};

use bytes::Bytes;
use mxbridge_core::{
	BridgeEvent, Err, Membership, PowerLevelsContent, Profile, Result, debug,
	utils::{RequestCache, millis_since_unix_epoch},
	warn,
};
use ruma::{
	EventId, MxcUri, OwnedEventId, OwnedMxcUri, OwnedRoomId, OwnedServerName, OwnedUserId,
	RoomAliasId, RoomId, RoomOrAliasId, UserId,
};
use serde_json::Value as JsonValue;

use super::backing::IntentBacking;
use crate::services::OnceServices;

/// Options for [`Intent::create_room`].
#[derive(Debug, Default)]
pub struct CreateRoomOpts {
	/// Create as this intent's user instead of the bridge bot.
	pub create_as_client: bool,

	/// Raw `createRoom` body.
	pub options: JsonValue,
}

/// Per-virtual-user action gateway. Lazily registers its user, guarantees
/// room membership before sends, and escalates power levels through the bot
/// when a send would be refused.
pub struct Intent {
	user_id: OwnedUserId,
	is_bot: bool,
	services: Arc<OnceServices>,
	backing: Arc<dyn IntentBacking>,

	registered: AtomicBool,
	register_lock: tokio::sync::Mutex<()>,
	join_locks: Mutex<HashMap<OwnedRoomId, Arc<tokio::sync::Mutex<()>>>>,

	profile_cache: RequestCache<OwnedUserId, Profile>,
	state_cache: RequestCache<OwnedRoomId, Vec<BridgeEvent>>,
	event_cache: RequestCache<String, BridgeEvent>,

	pub(super) last_used: AtomicU64,
}

impl Intent {
	pub(super) fn new(
		user_id: OwnedUserId,
		is_bot: bool,
		services: Arc<OnceServices>,
		backing: Arc<dyn IntentBacking>,
	) -> Self {
		let config = services.server.config.get();
		let ttl = Duration::from_millis(config.request_timeout_ms);
		let size = config.intent_cache_size;

		Self {
			user_id,
			is_bot,
			services,
			backing,
			registered: AtomicBool::new(false),
			register_lock: tokio::sync::Mutex::new(()),
			join_locks: Mutex::new(HashMap::new()),
			profile_cache: RequestCache::new(ttl, size),
			state_cache: RequestCache::new(ttl, size),
			event_cache: RequestCache::new(ttl, size),
			last_used: AtomicU64::new(millis_since_unix_epoch()),
		}
	}

	#[inline]
	#[must_use]
	pub fn user_id(&self) -> &UserId { &self.user_id }

	#[inline]
	#[must_use]
	pub fn is_bot(&self) -> bool { self.is_bot }

	/// The identity asserted on homeserver calls; the bot uses the bare
	/// appservice token.
	fn as_user(&self) -> Option<&UserId> {
		(!self.is_bot).then_some(self.user_id.as_ref())
	}

	fn touch(&self) {
		self.last_used
			.store(millis_since_unix_epoch(), Ordering::Relaxed);
	}

	// --- registration & membership ------------------------------------

	/// Idempotent user registration. Conflicts (`M_USER_IN_USE`,
	/// `M_EXCLUSIVE`) mean the user already exists and count as success.
	pub async fn ensure_registered(&self) -> Result {
		self.touch();
		if self.registered.load(Ordering::Acquire)
			|| self.backing.is_registered(&self.user_id)
		{
			return Ok(());
		}

		let _guard = self.register_lock.lock().await;
		if self.registered.load(Ordering::Acquire) {
			return Ok(());
		}

		match self
			.services
			.client
			.register_user(self.user_id.localpart())
			.await
		{
			| Ok(()) => {},
			| Err(e) if e.is_register_conflict() => {
				debug!(user = %self.user_id, "already registered: {e}");
			},
			| Err(e) => return Err(e),
		}

		self.registered.store(true, Ordering::Release);
		self.backing.mark_registered(&self.user_id);
		Ok(())
	}

	fn join_lock(&self, room_id: &RoomId) -> Arc<tokio::sync::Mutex<()>> {
		self.join_locks
			.lock()
			.expect("join locks")
			.entry(room_id.to_owned())
			.or_default()
			.clone()
	}

	pub async fn ensure_joined(&self, room_id: &RoomId) -> Result {
		self.ensure_joined_with(room_id, false, &[], false)
			.await
	}

	/// The join ladder: cached join short-circuits, then self-join, then
	/// bot-invite + self-join, then bot-join + bot-invite + self-join.
	pub async fn ensure_joined_with(
		&self,
		room_id: &RoomId,
		ignore_cache: bool,
		via: &[OwnedServerName],
		passthrough_error: bool,
	) -> Result {
		self.ensure_registered().await?;

		if !ignore_cache
			&& self.backing.membership(room_id, &self.user_id) == Membership::Join
		{
			return Ok(());
		}

		let lock = self.join_lock(room_id);
		let _guard = lock.lock().await;

		if !ignore_cache
			&& self.backing.membership(room_id, &self.user_id) == Membership::Join
		{
			return Ok(());
		}

		let client = &self.services.client;
		let mark_joined = || {
			self.backing.set_membership(
				room_id,
				&self.user_id,
				Membership::Join,
				Profile::default(),
			);
		};

		// rung 1: join as ourselves
		let first = client
			.join_room(self.as_user(), room_id.into(), via)
			.await;
		match first {
			| Ok(_) => {
				mark_joined();
				return Ok(());
			},
			| Err(e) if e.is_forbidden() && !self.is_bot => {},
			| Err(e) if passthrough_error => return Err(e),
			| Err(e) => {
				debug!(room = %room_id, user = %self.user_id, "join failed: {e}");
				return Err!(Request(Forbidden("Failed to join room")));
			},
		}

		// rung 2: bot invites us, then we join
		let second = async {
			client
				.invite_user(None, room_id, &self.user_id)
				.await?;
			client
				.join_room(self.as_user(), room_id.into(), via)
				.await
		}
		.await;
		match second {
			| Ok(_) => {
				mark_joined();
				return Ok(());
			},
			| Err(e) if e.is_forbidden() => {},
			| Err(e) if passthrough_error => return Err(e),
			| Err(e) => {
				debug!(room = %room_id, user = %self.user_id, "invited join failed: {e}");
				return Err!(Request(Forbidden("Failed to join room")));
			},
		}

		// rung 3: bot joins first, invites us, then we join
		let third = async {
			client.join_room(None, room_id.into(), via).await?;
			client
				.invite_user(None, room_id, &self.user_id)
				.await?;
			client
				.join_room(self.as_user(), room_id.into(), via)
				.await
		}
		.await;
		match third {
			| Ok(_) => {
				mark_joined();
				Ok(())
			},
			| Err(e) if passthrough_error => Err(e),
			| Err(e) => {
				warn!(room = %room_id, user = %self.user_id, "exhausted join ladder: {e}");
				Err!(Request(Forbidden("Failed to join room")))
			},
		}
	}

	/// Join a room (or alias), returning the canonical room id.
	pub async fn join(
		&self,
		room: &RoomOrAliasId,
		via: &[OwnedServerName],
	) -> Result<OwnedRoomId> {
		self.touch();
		let room_id = self.resolve_room(room).await?;
		self.ensure_joined_with(&room_id, false, via, true)
			.await?;
		Ok(room_id)
	}

	pub async fn resolve_room(&self, room: &RoomOrAliasId) -> Result<OwnedRoomId> {
		if room.is_room_id() {
			return RoomId::parse(room.as_str()).map_err(Into::into);
		}

		let alias = RoomAliasId::parse(room.as_str())?;
		self.services.client.resolve_alias(&alias).await
	}

	/// Leave; a reason turns this into a self-kick so the reason lands in
	/// the membership event.
	pub async fn leave(&self, room_id: &RoomId, reason: Option<&str>) -> Result {
		self.touch();
		let result = match reason {
			| Some(reason) =>
				self.services
					.client
					.kick_user(self.as_user(), room_id, &self.user_id, Some(reason))
					.await,
			| None =>
				self.services
					.client
					.leave_room(self.as_user(), room_id)
					.await,
		};

		if result.is_ok() {
			self.backing.set_membership(
				room_id,
				&self.user_id,
				Membership::Leave,
				Profile::default(),
			);
		}

		result
	}

	pub async fn invite(&self, room_id: &RoomId, target: &UserId) -> Result {
		self.touch();
		self.ensure_joined(room_id).await?;
		self.services
			.client
			.invite_user(self.as_user(), room_id, target)
			.await
	}

	pub async fn kick(&self, room_id: &RoomId, target: &UserId, reason: Option<&str>) -> Result {
		self.touch();
		if target != self.user_id {
			self.ensure_joined(room_id).await?;
		}

		self.services
			.client
			.kick_user(self.as_user(), room_id, target, reason)
			.await
	}

	pub async fn ban(&self, room_id: &RoomId, target: &UserId, reason: Option<&str>) -> Result {
		self.touch();
		self.ensure_joined(room_id).await?;
		self.services
			.client
			.ban_user(self.as_user(), room_id, target, reason)
			.await
	}

	pub async fn unban(&self, room_id: &RoomId, target: &UserId) -> Result {
		self.touch();
		self.ensure_joined(room_id).await?;
		self.services
			.client
			.unban_user(self.as_user(), room_id, target)
			.await
	}

	// --- power levels --------------------------------------------------

	async fn power_levels_for(&self, room_id: &RoomId) -> Result<PowerLevelsContent> {
		if let Some(cached) = self.backing.power_levels(room_id) {
			return Ok(cached);
		}

		let content = match self
			.services
			.client
			.state_event(self.as_user(), room_id, "m.room.power_levels", "")
			.await
		{
			| Ok(value) => serde_json::from_value(value)?,
			| Err(e) if e.is_not_found() => PowerLevelsContent::default(),
			| Err(e) => return Err(e),
		};

		self.backing
			.set_power_levels(room_id, content.clone());
		Ok(content)
	}

	/// Guarantee this user can send `event_type`, escalating through the
	/// bot when possible. Fails when even the bot cannot modify power
	/// levels.
	pub async fn ensure_has_power_level_for(
		&self,
		room_id: &RoomId,
		event_type: &str,
		is_state: bool,
	) -> Result {
		let pl = self.power_levels_for(room_id).await?;
		let required = pl.required_for(event_type, is_state);
		let have = pl.user_power(&self.user_id);
		if have >= required {
			return Ok(());
		}

		let bot = self.services.globals.bot_user_id();
		let bot_power = pl.user_power(bot);
		let modify_level = pl.required_to_modify();
		if bot_power < modify_level {
			return Err!(Request(Forbidden(
				"Cannot ensure power level for {event_type}: user {} has {have} < {required} \
				 and bot cannot modify power levels ({bot_power} < {modify_level})",
				self.user_id,
			)));
		}

		let mut escalated = pl;
		escalated.set_user_power(&self.user_id, Some(required));
		let content = serde_json::to_value(&escalated)?;

		self.services
			.client
			.send_state_event(None, room_id, "m.room.power_levels", "", content)
			.await?;

		self.backing.set_power_levels(room_id, escalated);
		Ok(())
	}

	/// Diff-and-set an explicit power entry; no-op when unchanged.
	pub async fn set_power_level(
		&self,
		room_id: &RoomId,
		target: &UserId,
		level: Option<i64>,
	) -> Result {
		self.touch();
		self.ensure_joined(room_id).await?;

		let mut pl = self.power_levels_for(room_id).await?;
		if !pl.set_user_power(target, level) {
			return Ok(());
		}

		let content = serde_json::to_value(&pl)?;
		self.send_state_event(room_id, "m.room.power_levels", "", content)
			.await?;
		self.backing.set_power_levels(room_id, pl);
		Ok(())
	}

	// --- sending -------------------------------------------------------

	pub async fn send_event(
		&self,
		room_id: &RoomId,
		event_type: &str,
		content: JsonValue,
	) -> Result<OwnedEventId> {
		self.touch();
		self.ensure_registered().await?;
		self.ensure_joined(room_id).await?;
		self.ensure_has_power_level_for(room_id, event_type, false)
			.await?;

		let event_id = self
			.services
			.client
			.send_event(self.as_user(), room_id, event_type, content)
			.await?;

		self.services
			.server
			.metrics
			.events_sent
			.fetch_add(1, Ordering::Relaxed);

		Ok(event_id)
	}

	pub async fn send_message(
		&self,
		room_id: &RoomId,
		content: JsonValue,
	) -> Result<OwnedEventId> {
		self.send_event(room_id, "m.room.message", content)
			.await
	}

	/// Optimistic state send: only a `Forbidden` refusal triggers the
	/// power-level dance, then one retry. Other errors propagate untouched.
	pub async fn send_state_event(
		&self,
		room_id: &RoomId,
		event_type: &str,
		state_key: &str,
		content: JsonValue,
	) -> Result<OwnedEventId> {
		self.touch();
		self.ensure_registered().await?;
		self.ensure_joined(room_id).await?;

		let first = self
			.services
			.client
			.send_state_event(self.as_user(), room_id, event_type, state_key, content.clone())
			.await;

		let event_id = match first {
			| Ok(event_id) => event_id,
			| Err(e) if e.is_forbidden() => {
				self.ensure_has_power_level_for(room_id, event_type, true)
					.await?;
				self.services
					.client
					.send_state_event(self.as_user(), room_id, event_type, state_key, content)
					.await?
			},
			| Err(e) => return Err(e),
		};

		self.state_cache.invalidate(room_id);
		Ok(event_id)
	}

	// --- reads ---------------------------------------------------------

	pub async fn get_profile(&self, user_id: &UserId, use_cache: bool) -> Result<Profile> {
		self.touch();
		self.ensure_registered().await?;

		if !use_cache {
			self.profile_cache.invalidate(user_id);
		}

		self.profile_cache
			.get_with(user_id.to_owned(), || {
				self.services
					.client
					.profile(self.as_user(), user_id)
			})
			.await
	}

	pub async fn room_state(
		&self,
		room_id: &RoomId,
		use_cache: bool,
	) -> Result<Vec<BridgeEvent>> {
		self.touch();
		self.ensure_registered().await?;
		self.ensure_joined(room_id).await?;

		if !use_cache {
			self.state_cache.invalidate(room_id);
		}

		self.state_cache
			.get_with(room_id.to_owned(), || {
				self.services
					.client
					.room_state(self.as_user(), room_id)
			})
			.await
	}

	pub async fn get_state_event(
		&self,
		room_id: &RoomId,
		event_type: &str,
		state_key: &str,
		use_cache: bool,
	) -> Result<JsonValue> {
		self.touch();
		self.ensure_registered().await?;
		self.ensure_joined(room_id).await?;

		if use_cache
			&& let Some(state) = self.state_cache.peek(room_id)
		{
			if let Some(event) = state.iter().find(|e| {
				e.kind == event_type && e.state_key.as_deref() == Some(state_key)
			}) {
				return Ok(event.content.clone());
			}
		}

		self.services
			.client
			.state_event(self.as_user(), room_id, event_type, state_key)
			.await
	}

	pub async fn get_event(
		&self,
		room_id: &RoomId,
		event_id: &EventId,
		use_cache: bool,
	) -> Result<BridgeEvent> {
		self.touch();
		self.ensure_registered().await?;

		let key = format!("{room_id}|{event_id}");
		if !use_cache {
			self.event_cache.invalidate(&key);
		}

		self.event_cache
			.get_with(key, || {
				self.services
					.client
					.event(self.as_user(), room_id, event_id)
			})
			.await
	}

	// --- rooms ---------------------------------------------------------

	/// Create a room as the bot (default) or as this user. When the bot
	/// creates on a ghost's behalf, the ghost is auto-invited; when the
	/// ghost creates for itself, a stray self-invite is stripped.
	pub async fn create_room(&self, opts: CreateRoomOpts) -> Result<OwnedRoomId> {
		self.touch();
		self.ensure_registered().await?;

		let mut options = match opts.options {
			| JsonValue::Object(map) => map,
			| JsonValue::Null => serde_json::Map::new(),
			| _ => return Err!(BadValue("createRoom options must be an object")),
		};

		let invites = options
			.entry("invite")
			.or_insert_with(|| JsonValue::Array(Vec::new()));

		let Some(invites) = invites.as_array_mut() else {
			return Err!(BadValue("createRoom invite list must be an array"));
		};

		let self_invite = JsonValue::from(self.user_id.as_str());
		if opts.create_as_client {
			invites.retain(|entry| entry != &self_invite);
		} else if !self.is_bot && !invites.contains(&self_invite) {
			invites.push(self_invite);
		}

		let creator_as_user = if opts.create_as_client { self.as_user() } else { None };
		let room_id = self
			.services
			.client
			.create_room(creator_as_user, JsonValue::Object(options))
			.await?;

		let creator = if opts.create_as_client {
			self.user_id.clone()
		} else {
			self.services.globals.bot_user_id().to_owned()
		};

		self.backing.set_membership(
			&room_id,
			&creator,
			Membership::Join,
			Profile::default(),
		);

		// room creators hold power 100 before any power_levels event exists
		if self.backing.power_levels(&room_id).is_none() {
			let mut pl = PowerLevelsContent::default();
			pl.set_user_power(&creator, Some(100));
			self.backing.set_power_levels(&room_id, pl);
		}

		Ok(room_id)
	}

	pub async fn create_alias(&self, alias: &RoomAliasId, room_id: &RoomId) -> Result {
		self.touch();
		self.ensure_registered().await?;
		self.services
			.client
			.create_alias(self.as_user(), alias, room_id)
			.await
	}

	pub async fn set_room_directory_visibility(
		&self,
		room_id: &RoomId,
		visible: bool,
	) -> Result {
		self.touch();
		self.services
			.client
			.set_room_directory_visibility(room_id, visible)
			.await
	}

	pub async fn set_network_room_visibility(
		&self,
		network_id: &str,
		room_id: &RoomId,
		visible: bool,
	) -> Result {
		self.touch();
		self.services
			.client
			.set_network_room_visibility(network_id, room_id, visible)
			.await
	}

	// --- profile & presence -------------------------------------------

	pub async fn set_display_name(&self, displayname: &str) -> Result {
		self.touch();
		self.ensure_registered().await?;
		self.services
			.client
			.set_displayname(self.as_user(), displayname)
			.await?;

		self.profile_cache.invalidate(&self.user_id);
		Ok(())
	}

	pub async fn set_avatar_url(&self, avatar_url: &MxcUri) -> Result {
		self.touch();
		self.ensure_registered().await?;
		self.services
			.client
			.set_avatar_url(self.as_user(), avatar_url)
			.await?;

		self.profile_cache.invalidate(&self.user_id);
		Ok(())
	}

	/// Fetch the live profile and set only the fields that differ.
	pub async fn ensure_profile(
		&self,
		displayname: Option<&str>,
		avatar_url: Option<&MxcUri>,
	) -> Result {
		self.touch();
		self.ensure_registered().await?;

		let current = self
			.services
			.client
			.profile(self.as_user(), &self.user_id)
			.await
			.unwrap_or_default();

		if let Some(wanted) = displayname
			&& current.displayname.as_deref() != Some(wanted)
		{
			self.set_display_name(wanted).await?;
		}

		if let Some(wanted) = avatar_url
			&& current.avatar_url.as_deref() != Some(wanted)
		{
			self.set_avatar_url(wanted).await?;
		}

		Ok(())
	}

	pub async fn set_presence(&self, presence: &str, status_msg: Option<&str>) -> Result {
		self.touch();
		self.ensure_registered().await?;
		self.services
			.client
			.set_presence(self.as_user(), presence, status_msg)
			.await
	}

	pub async fn send_typing(&self, room_id: &RoomId, typing: bool) -> Result {
		const TYPING_TIMEOUT_MS: u64 = 20 * 1000;

		self.touch();
		self.ensure_registered().await?;
		self.ensure_joined(room_id).await?;
		self.services
			.client
			.send_typing(self.as_user(), room_id, typing, TYPING_TIMEOUT_MS)
			.await
	}

	pub async fn send_read_receipt(&self, room_id: &RoomId, event_id: &EventId) -> Result {
		self.touch();
		self.ensure_registered().await?;
		self.ensure_joined(room_id).await?;
		self.services
			.client
			.send_read_receipt(self.as_user(), room_id, event_id)
			.await
	}

	pub async fn upload_content(
		&self,
		bytes: Bytes,
		content_type: Option<&str>,
		filename: Option<&str>,
	) -> Result<OwnedMxcUri> {
		self.touch();
		self.ensure_registered().await?;
		self.services
			.client
			.upload(self.as_user(), bytes, content_type, filename)
			.await
	}

	// --- event feedback ------------------------------------------------

	/// Maintain caches from a state event observed on the inbound stream.
	pub fn on_event(&self, event: &BridgeEvent) {
		let Some(room_id) = event.room_id.as_deref() else {
			return;
		};

		if !event.is_state() {
			return;
		}

		self.state_cache.invalidate(room_id);

		match event.kind.as_str() {
			| "m.room.member"
				if event.state_key.as_deref() == Some(self.user_id.as_str()) =>
			{
				if let Some(member) = event.content_as::<mxbridge_core::MemberContent>() {
					self.backing.set_membership(
						room_id,
						&self.user_id,
						member.membership,
						Profile {
							displayname: member.displayname,
							avatar_url: member.avatar_url,
						},
					);
				}
			},
			| "m.room.power_levels" => {
				if let Some(pl) = event.content_as::<PowerLevelsContent>() {
					self.backing.set_power_levels(room_id, pl);
				}
			},
			| _ => {},
		}
	}

	#[cfg(test)]
	pub(crate) fn cached_power_levels(&self, room_id: &RoomId) -> Option<PowerLevelsContent> {
		self.backing.power_levels(room_id)
	}

	#[cfg(test)]
	pub(crate) fn cached_room_state(&self, room_id: &RoomId) -> Option<Vec<BridgeEvent>> {
		self.state_cache.peek(room_id)
	}
}
