use std::collections::BTreeMap;

use bytes::Bytes;
use futures::stream::BoxStream;
use mxbridge_core::{BridgeEvent, Result};
use ruma::{OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Minimal `/sync` projection: the broker only asks for encrypted timeline
/// events plus presence.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncResponse {
	pub next_batch: String,

	#[serde(default)]
	pub rooms: SyncRooms,

	#[serde(default)]
	pub presence: SyncPresence,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncRooms {
	#[serde(default)]
	pub join: BTreeMap<OwnedRoomId, SyncJoinedRoom>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncJoinedRoom {
	#[serde(default)]
	pub timeline: SyncTimeline,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncTimeline {
	#[serde(default)]
	pub events: Vec<BridgeEvent>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncPresence {
	#[serde(default)]
	pub events: Vec<BridgeEvent>,
}

/// `GET /presence/{userId}/status` result.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PresenceStatus {
	#[serde(default)]
	pub presence: String,

	#[serde(default)]
	pub currently_active: Option<bool>,

	#[serde(default)]
	pub last_active_ago: Option<u64>,

	#[serde(default)]
	pub status_msg: Option<String>,
}

/// Synapse admin whois result, reduced to session recency.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WhoisInfo {
	#[serde(default)]
	pub user_id: Option<OwnedUserId>,

	#[serde(default)]
	pub devices: BTreeMap<String, WhoisDevice>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WhoisDevice {
	#[serde(default)]
	pub sessions: Vec<WhoisSession>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WhoisSession {
	#[serde(default)]
	pub connections: Vec<WhoisConnection>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WhoisConnection {
	#[serde(default)]
	pub ip: Option<String>,

	#[serde(default)]
	pub last_seen: Option<u64>,

	#[serde(default)]
	pub user_agent: Option<String>,
}

impl WhoisInfo {
	/// Millisecond timestamp of the most recent connection across sessions.
	#[must_use]
	pub fn last_seen(&self) -> Option<u64> {
		self.devices
			.values()
			.flat_map(|device| &device.sessions)
			.flat_map(|session| &session.connections)
			.filter_map(|connection| connection.last_seen)
			.max()
	}
}

/// Raw outcome of the open-registration probe; classification happens in the
/// ban-sync service.
#[derive(Clone, Debug)]
pub struct RegisterProbe {
	pub status: u16,
	pub body: JsonValue,
}

/// A streaming media download with the passthrough headers.
pub struct MediaDownload {
	pub content_type: Option<String>,
	pub content_length: Option<u64>,
	pub content_disposition: Option<String>,
	pub stream: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for MediaDownload {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MediaDownload")
			.field("content_type", &self.content_type)
			.field("content_length", &self.content_length)
			.field("content_disposition", &self.content_disposition)
			.finish_non_exhaustive()
	}
}
