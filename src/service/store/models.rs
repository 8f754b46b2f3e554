//! Bridged-entity models. These round-trip through the pluggable stores, so
//! serialization is part of their contract: `deserialize(serialize(x)) == x`.

use mxbridge_core::Result;
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The Matrix side of a bridged room.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct MatrixRoom {
	pub room_id: OwnedRoomId,

	#[serde(default, skip_serializing_if = "JsonValue::is_null")]
	pub data: JsonValue,
}

impl MatrixRoom {
	#[must_use]
	pub fn new(room_id: OwnedRoomId) -> Self {
		Self { room_id, data: JsonValue::Null }
	}

	pub fn serialize(&self) -> Result<JsonValue> {
		serde_json::to_value(self).map_err(Into::into)
	}

	pub fn deserialize(value: JsonValue) -> Result<Self> {
		serde_json::from_value(value).map_err(Into::into)
	}
}

/// The foreign-network side of a bridged room.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RemoteRoom {
	pub id: String,

	#[serde(default, skip_serializing_if = "JsonValue::is_null")]
	pub data: JsonValue,
}

impl RemoteRoom {
	#[must_use]
	pub fn new(id: impl Into<String>) -> Self {
		Self { id: id.into(), data: JsonValue::Null }
	}
}

/// A row linking a Matrix room to a remote room, with free-form link data.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RoomEntry {
	pub id: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub matrix: Option<MatrixRoom>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub remote: Option<RemoteRoom>,

	#[serde(default, skip_serializing_if = "JsonValue::is_null")]
	pub data: JsonValue,
}

impl RoomEntry {
	#[must_use]
	pub fn link(matrix: MatrixRoom, remote: RemoteRoom) -> Self {
		let id = Self::id_for(Some(&matrix), Some(&remote));
		Self {
			id,
			matrix: Some(matrix),
			remote: Some(remote),
			data: JsonValue::Null,
		}
	}

	/// Stable composite id for a link row.
	#[must_use]
	pub fn id_for(matrix: Option<&MatrixRoom>, remote: Option<&RemoteRoom>) -> String {
		format!(
			"{}__{}",
			matrix.map_or("", |m| m.room_id.as_str()),
			remote.map_or("", |r| r.id.as_str())
		)
	}
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct MatrixUser {
	pub user_id: OwnedUserId,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub displayname: Option<String>,

	#[serde(default, skip_serializing_if = "JsonValue::is_null")]
	pub data: JsonValue,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RemoteUser {
	pub id: String,

	#[serde(default, skip_serializing_if = "JsonValue::is_null")]
	pub data: JsonValue,
}

/// A matrix-event ↔ remote-event mapping row.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct EventEntry {
	pub matrix_room: OwnedRoomId,
	pub matrix_event: OwnedEventId,
	pub remote_room: String,
	pub remote_event: String,

	#[serde(default, skip_serializing_if = "JsonValue::is_null")]
	pub data: JsonValue,
}

/// Rolling activity record: UTC-midnight seconds, newest first, at most 31.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct UserActivityRecord {
	#[serde(default)]
	pub ts: Vec<u64>,

	#[serde(default)]
	pub metadata: UserActivityMetadata,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct UserActivityMetadata {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub private: Option<bool>,

	/// Sticky once set.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub active: Option<bool>,
}

#[cfg(test)]
mod tests {
	use ruma::room_id;
	use serde_json::json;

	use super::{MatrixRoom, RemoteRoom, RoomEntry};

	#[test]
	fn matrix_room_roundtrip_is_identity() {
		let mut room = MatrixRoom::new(room_id!("!abc:example.org").to_owned());
		room.data = json!({"portal": true, "topic": "general"});

		let serialized = room.serialize().unwrap();
		let back = MatrixRoom::deserialize(serialized).unwrap();
		assert_eq!(back, room);
	}

	#[test]
	fn entry_ids_are_stable_composites() {
		let entry = RoomEntry::link(
			MatrixRoom::new(room_id!("!abc:example.org").to_owned()),
			RemoteRoom::new("remote-1"),
		);
		assert_eq!(entry.id, "!abc:example.org__remote-1");
	}
}
