use ruma::{OwnedEventId, OwnedMxcUri, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A weakly-typed Matrix event as delivered in an appservice transaction or a
/// sync response. Bridges see every event type under the sun; content stays
/// raw JSON until a component needs a concrete view of it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BridgeEvent {
	pub event_id: OwnedEventId,

	/// Present on transaction events; sync timeline events carry the room in
	/// their envelope instead and have it injected before dispatch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<OwnedRoomId>,

	pub sender: OwnedUserId,

	#[serde(rename = "type")]
	pub kind: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub state_key: Option<String>,

	#[serde(default)]
	pub content: JsonValue,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub origin_server_ts: Option<u64>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub unsigned: Option<JsonValue>,
}

impl BridgeEvent {
	#[inline]
	#[must_use]
	pub fn is_state(&self) -> bool { self.state_key.is_some() }

	#[inline]
	#[must_use]
	pub fn is_type(&self, kind: &str) -> bool { self.kind == kind }

	/// Content parsed into a concrete view; `None` when the shape is foreign.
	#[must_use]
	pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
		serde_json::from_value(self.content.clone()).ok()
	}

	pub fn require_room(&self) -> crate::Result<&ruma::RoomId> {
		self.room_id
			.as_deref()
			.ok_or_else(|| crate::err!(BadValue("event {} has no room_id", self.event_id)))
	}
}

/// `m.room.member` content, reduced to the fields membership tracking needs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MemberContent {
	#[serde(default)]
	pub membership: Membership,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub displayname: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar_url: Option<OwnedMxcUri>,

	#[serde(flatten)]
	pub rest: serde_json::Map<String, JsonValue>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
	Join,
	Invite,
	Leave,
	Ban,
	Knock,
	#[default]
	#[serde(other)]
	Unknown,
}

impl Membership {
	/// Whether this membership has ever implied the user exists on the
	/// homeserver (the registered-users invariant).
	#[inline]
	#[must_use]
	pub fn implies_registered(self) -> bool { matches!(self, Self::Join | Self::Leave) }
}

impl std::fmt::Display for Membership {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			| Self::Join => "join",
			| Self::Invite => "invite",
			| Self::Leave => "leave",
			| Self::Ban => "ban",
			| Self::Knock => "knock",
			| Self::Unknown => "unknown",
		};
		write!(f, "{s}")
	}
}

/// `m.room.tombstone` content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TombstoneContent {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<String>,

	pub replacement_room: OwnedRoomId,
}

/// A user profile as returned by `GET /profile/{userId}`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Profile {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub displayname: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar_url: Option<OwnedMxcUri>,
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::{BridgeEvent, MemberContent, Membership, TombstoneContent};

	#[test]
	fn member_event_roundtrip() {
		let ev: BridgeEvent = serde_json::from_value(json!({
			"event_id": "$abc:example.org",
			"room_id": "!r:example.org",
			"sender": "@u:example.org",
			"type": "m.room.member",
			"state_key": "@u:example.org",
			"content": {"membership": "join", "displayname": "U"},
			"origin_server_ts": 1_700_000_000_000u64,
		}))
		.unwrap();

		assert!(ev.is_state());
		let member: MemberContent = ev.content_as().unwrap();
		assert_eq!(member.membership, Membership::Join);
		assert!(member.membership.implies_registered());
	}

	#[test]
	fn unknown_membership_is_tolerated() {
		let member: MemberContent =
			serde_json::from_value(json!({"membership": "singing"})).unwrap();
		assert_eq!(member.membership, Membership::Unknown);
		assert!(!member.membership.implies_registered());
	}

	#[test]
	fn tombstone_content() {
		let content: TombstoneContent = serde_json::from_value(json!({
			"body": "This room has been replaced",
			"replacement_room": "!new:example.org",
		}))
		.unwrap();
		assert_eq!(content.replacement_room.as_str(), "!new:example.org");
	}
}
