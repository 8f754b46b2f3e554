//! The seam a concrete bridge implements. Every hook has a do-nothing
//! default so minimal bridges only supply `on_event`.

use async_trait::async_trait;
use mxbridge_core::{BridgeEvent, Config, Result};
use ruma::{OwnedMxcUri, RoomAliasId, RoomId, UserId};
use serde_json::Value as JsonValue;

#[async_trait]
pub trait BridgeController: Send + Sync {
	/// A timeline or state event addressed to this bridge. Rejections are
	/// reported back into the room as bridge errors when configured.
	async fn on_event(&self, event: &BridgeEvent) -> Result;

	/// Typing, receipts and presence, when the registration opts in.
	async fn on_ephemeral(&self, event: &BridgeEvent) -> Result {
		let _ = event;
		Ok(())
	}

	/// Homeserver query for an unknown user in our namespace. Returning a
	/// provision causes the user to be created; `None` rejects the query.
	async fn on_user_query(&self, user: &UserId) -> Result<Option<UserProvision>> {
		let _ = user;
		Ok(None)
	}

	/// Homeserver query for an unknown alias in our namespace.
	async fn on_alias_query(&self, alias: &RoomAliasId) -> Result<Option<RoomProvision>> {
		let _ = alias;
		Ok(None)
	}

	/// A room upgrade finished migrating `old` into `new`.
	async fn on_room_migrated(&self, old: &RoomId, new: &RoomId) -> Result {
		let _ = (old, new);
		Ok(())
	}

	/// SIGHUP delivered a fresh configuration snapshot.
	async fn on_config_changed(&self, config: &Config) -> Result {
		let _ = config;
		Ok(())
	}

	/// The rolling active-user count changed (debounced).
	async fn on_user_activity_changed(&self, active_users: u64) -> Result {
		let _ = active_users;
		Ok(())
	}

	/// Effect of crossing the user limit; the blocker only transitions state
	/// when this succeeds.
	async fn block_bridge(&self) -> Result { Ok(()) }

	/// Effect of dropping back under the user limit.
	async fn unblock_bridge(&self) -> Result { Ok(()) }

	/// Whether ephemeral events should be dispatched at all.
	fn wants_ephemeral(&self) -> bool { false }
}

/// Answer to a user query: create the user and decorate its profile.
#[derive(Clone, Debug, Default)]
pub struct UserProvision {
	pub displayname: Option<String>,
	pub avatar_url: Option<OwnedMxcUri>,
}

/// Answer to an alias query: create the room with these `createRoom` options.
#[derive(Clone, Debug)]
pub struct RoomProvision {
	pub options: JsonValue,
}
