use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use mxbridge_core::{BridgeEvent, Profile, Result};
use ruma::{
	EventId, MxcUri, OwnedEventId, OwnedMxcUri, OwnedRoomId, OwnedServerName, OwnedUserId,
	RoomAliasId, RoomId, RoomOrAliasId, UserId,
};
use serde_json::Value as JsonValue;

use crate::response::{MediaDownload, PresenceStatus, RegisterProbe, SyncResponse, WhoisInfo};

/// Everything the bridge asks of a homeserver. `as_user` selects the
/// appservice identity to assert; `None` acts as the bridge bot.
///
/// Implementations map transport failures into the stable error vocabulary;
/// callers never see raw HTTP.
#[async_trait]
pub trait Homeserver: Send + Sync {
	async fn register_user(&self, localpart: &str) -> Result<()>;

	async fn join_room(
		&self,
		as_user: Option<&UserId>,
		room: &RoomOrAliasId,
		via: &[OwnedServerName],
	) -> Result<OwnedRoomId>;

	async fn leave_room(&self, as_user: Option<&UserId>, room: &RoomId) -> Result<()>;

	async fn invite_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
	) -> Result<()>;

	async fn kick_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
		reason: Option<&str>,
	) -> Result<()>;

	async fn ban_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
		reason: Option<&str>,
	) -> Result<()>;

	async fn unban_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
	) -> Result<()>;

	async fn joined_members(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
	) -> Result<BTreeMap<OwnedUserId, Profile>>;

	async fn resolve_alias(&self, alias: &RoomAliasId) -> Result<OwnedRoomId>;

	/// `options` is the raw `POST /createRoom` body.
	async fn create_room(
		&self,
		as_user: Option<&UserId>,
		options: JsonValue,
	) -> Result<OwnedRoomId>;

	async fn send_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		content: JsonValue,
	) -> Result<OwnedEventId>;

	async fn send_state_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
		content: JsonValue,
	) -> Result<OwnedEventId>;

	async fn room_state(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
	) -> Result<Vec<BridgeEvent>>;

	async fn state_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
	) -> Result<JsonValue>;

	async fn event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_id: &EventId,
	) -> Result<BridgeEvent>;

	async fn profile(&self, as_user: Option<&UserId>, user: &UserId) -> Result<Profile>;

	async fn set_displayname(&self, as_user: Option<&UserId>, displayname: &str) -> Result<()>;

	async fn set_avatar_url(&self, as_user: Option<&UserId>, avatar_url: &MxcUri) -> Result<()>;

	async fn set_presence(
		&self,
		as_user: Option<&UserId>,
		presence: &str,
		status_msg: Option<&str>,
	) -> Result<()>;

	async fn presence(&self, user: &UserId) -> Result<PresenceStatus>;

	async fn send_typing(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		typing: bool,
		timeout_ms: u64,
	) -> Result<()>;

	async fn send_read_receipt(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_id: &EventId,
	) -> Result<()>;

	async fn create_alias(
		&self,
		as_user: Option<&UserId>,
		alias: &RoomAliasId,
		room: &RoomId,
	) -> Result<()>;

	async fn upload(
		&self,
		as_user: Option<&UserId>,
		bytes: Bytes,
		content_type: Option<&str>,
		filename: Option<&str>,
	) -> Result<OwnedMxcUri>;

	async fn set_room_directory_visibility(&self, room: &RoomId, visible: bool) -> Result<()>;

	async fn set_network_room_visibility(
		&self,
		network_id: &str,
		room: &RoomId,
		visible: bool,
	) -> Result<()>;

	/// Synapse admin whois; only meaningful when [`admin_probe`] succeeded.
	///
	/// [`admin_probe`]: Self::admin_probe
	async fn whois(&self, user: &UserId) -> Result<WhoisInfo>;

	/// Determine admin-API reachability with a deliberately malformed whois
	/// probe: 200/400 mean the API answered, anything else means no access.
	async fn admin_probe(&self) -> Result<bool>;

	async fn sync(
		&self,
		as_user: &UserId,
		filter: &JsonValue,
		since: Option<&str>,
		timeout_ms: u64,
	) -> Result<SyncResponse>;

	/// `POST /register` with an empty body against a *foreign* homeserver,
	/// returning the raw status and body for open-registration
	/// classification.
	async fn probe_registration(&self, host: &str) -> Result<RegisterProbe>;

	async fn download(
		&self,
		mxc: &MxcUri,
		content_token: Option<&str>,
	) -> Result<MediaDownload>;
}
