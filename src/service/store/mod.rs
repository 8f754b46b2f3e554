//! Pluggable persistence. The bridge mandates no schema; stores expose
//! upsert/select/delete by stable keys and embedders may swap in anything
//! that outlives the process. The in-memory implementations back tests and
//! bridges that do not need durability.

pub mod memory;
mod models;

use std::sync::Arc;

use async_trait::async_trait;
use mxbridge_core::Result;
use ruma::{EventId, RoomId, UserId};

pub use self::models::{
	EventEntry, MatrixRoom, MatrixUser, RemoteRoom, RemoteUser, RoomEntry, UserActivityMetadata,
	UserActivityRecord,
};

#[async_trait]
pub trait RoomBridgeStore: Send + Sync {
	async fn upsert_entry(&self, entry: RoomEntry) -> Result;
	async fn entry_by_id(&self, id: &str) -> Result<Option<RoomEntry>>;
	async fn entries_by_matrix_id(&self, room_id: &RoomId) -> Result<Vec<RoomEntry>>;
	async fn entries_by_remote_id(&self, remote_id: &str) -> Result<Vec<RoomEntry>>;
	async fn delete_entry(&self, id: &str) -> Result;
}

#[async_trait]
pub trait UserBridgeStore: Send + Sync {
	async fn set_matrix_user(&self, user: MatrixUser) -> Result;
	async fn get_matrix_user(&self, user_id: &UserId) -> Result<Option<MatrixUser>>;
	async fn set_remote_user(&self, user: RemoteUser) -> Result;
	async fn get_remote_user(&self, id: &str) -> Result<Option<RemoteUser>>;
	async fn delete_remote_user(&self, id: &str) -> Result;
}

#[async_trait]
pub trait EventBridgeStore: Send + Sync {
	async fn upsert_event(&self, entry: EventEntry) -> Result;
	async fn get_by_matrix_id(
		&self,
		room_id: &RoomId,
		event_id: &EventId,
	) -> Result<Option<EventEntry>>;
	async fn get_by_remote_id(
		&self,
		remote_room: &str,
		remote_event: &str,
	) -> Result<Option<EventEntry>>;
	async fn remove_by_matrix_id(&self, room_id: &RoomId, event_id: &EventId) -> Result;
}

#[async_trait]
pub trait UserActivityStore: Send + Sync {
	async fn get_activity(&self, user_id: &UserId) -> Result<Option<UserActivityRecord>>;
	async fn set_activity(&self, user_id: &UserId, record: UserActivityRecord) -> Result;
	async fn all_activity(&self) -> Result<Vec<(ruma::OwnedUserId, UserActivityRecord)>>;
}

/// The bundle of stores handed to `Services::build`. Defaults are in-memory.
#[derive(Clone)]
pub struct Stores {
	pub rooms: Arc<dyn RoomBridgeStore>,
	pub users: Arc<dyn UserBridgeStore>,
	pub events: Arc<dyn EventBridgeStore>,
	pub activity: Arc<dyn UserActivityStore>,
}

impl Default for Stores {
	fn default() -> Self {
		Self {
			rooms: Arc::new(memory::MemoryRoomStore::default()),
			users: Arc::new(memory::MemoryUserStore::default()),
			events: Arc::new(memory::MemoryEventStore::default()),
			activity: Arc::new(memory::MemoryActivityStore::default()),
		}
	}
}

/// Thin service wrapper so siblings reach stores through the usual handles.
pub struct Service {
	pub rooms: Arc<dyn RoomBridgeStore>,
	pub users: Arc<dyn UserBridgeStore>,
	pub events: Arc<dyn EventBridgeStore>,
	pub activity: Arc<dyn UserActivityStore>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			rooms: args.stores.rooms.clone(),
			users: args.stores.users.clone(),
			events: args.stores.events.clone(),
			activity: args.stores.activity.clone(),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}
