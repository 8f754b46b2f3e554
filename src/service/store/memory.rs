use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use mxbridge_core::Result;
use ruma::{EventId, OwnedUserId, RoomId, UserId};

use super::{
	EventBridgeStore, EventEntry, MatrixUser, RemoteUser, RoomBridgeStore, RoomEntry,
	UserActivityRecord, UserActivityStore, UserBridgeStore,
};

#[derive(Default)]
pub struct MemoryRoomStore {
	entries: RwLock<HashMap<String, RoomEntry>>,
}

#[async_trait]
impl RoomBridgeStore for MemoryRoomStore {
	async fn upsert_entry(&self, entry: RoomEntry) -> Result {
		self.entries
			.write()
			.expect("store lock")
			.insert(entry.id.clone(), entry);
		Ok(())
	}

	async fn entry_by_id(&self, id: &str) -> Result<Option<RoomEntry>> {
		Ok(self
			.entries
			.read()
			.expect("store lock")
			.get(id)
			.cloned())
	}

	async fn entries_by_matrix_id(&self, room_id: &RoomId) -> Result<Vec<RoomEntry>> {
		Ok(self
			.entries
			.read()
			.expect("store lock")
			.values()
			.filter(|entry| {
				entry
					.matrix
					.as_ref()
					.is_some_and(|m| m.room_id == room_id)
			})
			.cloned()
			.collect())
	}

	async fn entries_by_remote_id(&self, remote_id: &str) -> Result<Vec<RoomEntry>> {
		Ok(self
			.entries
			.read()
			.expect("store lock")
			.values()
			.filter(|entry| {
				entry
					.remote
					.as_ref()
					.is_some_and(|r| r.id == remote_id)
			})
			.cloned()
			.collect())
	}

	async fn delete_entry(&self, id: &str) -> Result {
		self.entries
			.write()
			.expect("store lock")
			.remove(id);
		Ok(())
	}
}

#[derive(Default)]
pub struct MemoryUserStore {
	matrix: RwLock<HashMap<OwnedUserId, MatrixUser>>,
	remote: RwLock<HashMap<String, RemoteUser>>,
}

#[async_trait]
impl UserBridgeStore for MemoryUserStore {
	async fn set_matrix_user(&self, user: MatrixUser) -> Result {
		self.matrix
			.write()
			.expect("store lock")
			.insert(user.user_id.clone(), user);
		Ok(())
	}

	async fn get_matrix_user(&self, user_id: &UserId) -> Result<Option<MatrixUser>> {
		Ok(self
			.matrix
			.read()
			.expect("store lock")
			.get(user_id)
			.cloned())
	}

	async fn set_remote_user(&self, user: RemoteUser) -> Result {
		self.remote
			.write()
			.expect("store lock")
			.insert(user.id.clone(), user);
		Ok(())
	}

	async fn get_remote_user(&self, id: &str) -> Result<Option<RemoteUser>> {
		Ok(self
			.remote
			.read()
			.expect("store lock")
			.get(id)
			.cloned())
	}

	async fn delete_remote_user(&self, id: &str) -> Result {
		self.remote
			.write()
			.expect("store lock")
			.remove(id);
		Ok(())
	}
}

#[derive(Default)]
pub struct MemoryEventStore {
	by_matrix: RwLock<HashMap<String, EventEntry>>,
	by_remote: RwLock<HashMap<String, String>>,
}

fn matrix_key(room_id: &RoomId, event_id: &EventId) -> String {
	format!("{room_id}\u{1f}{event_id}")
}

fn remote_key(remote_room: &str, remote_event: &str) -> String {
	format!("{remote_room}\u{1f}{remote_event}")
}

#[async_trait]
impl EventBridgeStore for MemoryEventStore {
	async fn upsert_event(&self, entry: EventEntry) -> Result {
		let mkey = matrix_key(&entry.matrix_room, &entry.matrix_event);
		let rkey = remote_key(&entry.remote_room, &entry.remote_event);

		self.by_remote
			.write()
			.expect("store lock")
			.insert(rkey, mkey.clone());
		self.by_matrix
			.write()
			.expect("store lock")
			.insert(mkey, entry);
		Ok(())
	}

	async fn get_by_matrix_id(
		&self,
		room_id: &RoomId,
		event_id: &EventId,
	) -> Result<Option<EventEntry>> {
		Ok(self
			.by_matrix
			.read()
			.expect("store lock")
			.get(&matrix_key(room_id, event_id))
			.cloned())
	}

	async fn get_by_remote_id(
		&self,
		remote_room: &str,
		remote_event: &str,
	) -> Result<Option<EventEntry>> {
		let mkey = self
			.by_remote
			.read()
			.expect("store lock")
			.get(&remote_key(remote_room, remote_event))
			.cloned();

		Ok(mkey.and_then(|mkey| {
			self.by_matrix
				.read()
				.expect("store lock")
				.get(&mkey)
				.cloned()
		}))
	}

	async fn remove_by_matrix_id(&self, room_id: &RoomId, event_id: &EventId) -> Result {
		let removed = self
			.by_matrix
			.write()
			.expect("store lock")
			.remove(&matrix_key(room_id, event_id));

		if let Some(entry) = removed {
			self.by_remote
				.write()
				.expect("store lock")
				.remove(&remote_key(&entry.remote_room, &entry.remote_event));
		}
		Ok(())
	}
}

#[derive(Default)]
pub struct MemoryActivityStore {
	records: RwLock<HashMap<OwnedUserId, UserActivityRecord>>,
}

#[async_trait]
impl UserActivityStore for MemoryActivityStore {
	async fn get_activity(&self, user_id: &UserId) -> Result<Option<UserActivityRecord>> {
		Ok(self
			.records
			.read()
			.expect("store lock")
			.get(user_id)
			.cloned())
	}

	async fn set_activity(&self, user_id: &UserId, record: UserActivityRecord) -> Result {
		self.records
			.write()
			.expect("store lock")
			.insert(user_id.to_owned(), record);
		Ok(())
	}

	async fn all_activity(&self) -> Result<Vec<(OwnedUserId, UserActivityRecord)>> {
		Ok(self
			.records
			.read()
			.expect("store lock")
			.iter()
			.map(|(user, record)| (user.clone(), record.clone()))
			.collect())
	}
}
