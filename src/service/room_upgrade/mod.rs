//! Tombstone-driven room migration. Join the successor (falling back to a
//! pending-invite wait when refused), rewrite store entries, run the
//! embedder's hook, then walk ghost users across.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use mxbridge_core::{
	BridgeEvent, Result, TombstoneContent, config::RoomUpgradeConfig, debug, err, info, warn,
};
use ruma::{OwnedRoomId, OwnedServerName, RoomId};

use crate::{services::OnceServices, store::RoomEntry};

pub struct Service {
	/// `replacement room → old room`, consulted when an invite arrives after
	/// a refused join.
	pending_invites: Mutex<HashMap<OwnedRoomId, OwnedRoomId>>,
	opts: RoomUpgradeConfig,
	services: Arc<OnceServices>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			pending_invites: Mutex::new(HashMap::new()),
			opts: args.server.config.get().room_upgrade.clone(),
			services: args.services.clone(),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	/// React to an `m.room.tombstone` in a bridged room.
	pub async fn on_tombstone(&self, event: &BridgeEvent) -> Result {
		if !self.opts.enabled {
			return Ok(());
		}

		let old_room = event.require_room()?.to_owned();
		let Some(tombstone) = event.content_as::<TombstoneContent>() else {
			return Err(err!(BadValue("tombstone without replacement_room")));
		};

		let new_room = tombstone.replacement_room;
		let via: Vec<OwnedServerName> = vec![event.sender.server_name().to_owned()];

		info!(%old_room, %new_room, "room upgrade detected");

		let bot = self.services.intent.bot();
		match bot
			.ensure_joined_with(&new_room, false, &via, true)
			.await
		{
			| Ok(()) => self.migrate(&old_room, &new_room).await,
			| Err(e) if e.is_forbidden() => {
				debug!(%new_room, "replacement join refused, awaiting invite");
				self.pending_invites
					.lock()
					.expect("pending lock")
					.insert(new_room, old_room);
				Ok(())
			},
			| Err(e) => {
				// do not poison state for a transient failure
				warn!(%new_room, "replacement join failed, upgrade abandoned: {e}");
				Ok(())
			},
		}
	}

	/// An invite for the bot arrived; if it names a pending replacement
	/// room, complete the migration. Unrelated invites are ignored.
	pub async fn on_invite(&self, room_id: &RoomId) -> Result {
		let old_room = {
			let mut pending = self.pending_invites.lock().expect("pending lock");
			pending.remove(room_id)
		};

		let Some(old_room) = old_room else {
			return Ok(());
		};

		let bot = self.services.intent.bot();
		bot.ensure_joined_with(room_id, true, &[], true)
			.await?;

		self.migrate(&old_room, room_id).await
	}

	#[must_use]
	pub fn has_pending_invite(&self, room_id: &RoomId) -> bool {
		self.pending_invites
			.lock()
			.expect("pending lock")
			.contains_key(room_id)
	}

	/// The ordered, best-effort migration pipeline.
	async fn migrate(&self, old_room: &RoomId, new_room: &RoomId) -> Result {
		if self.opts.migrate_store_entries && !self.migrate_entries(old_room, new_room).await? {
			return Err(err!(
				"room upgrade aborted: no store entry migrated from {old_room}"
			));
		}

		self.services
			.controller
			.on_room_migrated(old_room, new_room)
			.await?;

		if self.opts.migrate_ghosts {
			self.migrate_ghosts(old_room, new_room).await;
		}

		self.services
			.membership_cache
			.forget_room(old_room);

		info!(%old_room, %new_room, "room upgrade complete");
		Ok(())
	}

	/// Returns false when entries existed but none migrated.
	async fn migrate_entries(&self, old_room: &RoomId, new_room: &RoomId) -> Result<bool> {
		let store = &self.services.store.rooms;
		let entries = store.entries_by_matrix_id(old_room).await?;
		if entries.is_empty() {
			debug!(%old_room, "no store entries to migrate");
			return Ok(true);
		}

		let mut migrated = 0_usize;
		for entry in entries {
			let old_id = entry.id.clone();
			match self.migrate_entry(entry, new_room).await {
				| Ok(new_id) => {
					if new_id != old_id {
						store.delete_entry(&old_id).await?;
					}
					migrated += 1;
				},
				| Err(e) => warn!(entry = %old_id, "entry migration failed: {e}"),
			}
		}

		Ok(migrated > 0)
	}

	/// Default entry migration: replace only the Matrix-side room id.
	async fn migrate_entry(&self, mut entry: RoomEntry, new_room: &RoomId) -> Result<String> {
		let Some(matrix) = entry.matrix.as_mut() else {
			return Ok(entry.id);
		};

		matrix.room_id = new_room.to_owned();
		entry.id = RoomEntry::id_for(entry.matrix.as_ref(), entry.remote.as_ref());

		let new_id = entry.id.clone();
		self.services
			.store
			.rooms
			.upsert_entry(entry)
			.await?;

		Ok(new_id)
	}

	/// Move every ghost from the old room to the new one; the bot leaves
	/// last. Individual failures are logged and skipped.
	async fn migrate_ghosts(&self, old_room: &RoomId, new_room: &RoomId) {
		let members = match self.joined_members(old_room).await {
			| Ok(members) => members,
			| Err(e) => {
				warn!(%old_room, "cannot list members for ghost migration: {e}");
				return;
			},
		};

		for user in members {
			if !self.services.globals.is_virtual_user(&user) {
				continue;
			}

			let intent = self.services.intent.get(&user);
			if let Err(e) = intent.leave(old_room, None).await {
				warn!(%user, %old_room, "ghost failed to leave old room: {e}");
			}
			if let Err(e) = intent
				.ensure_joined_with(new_room, true, &[], true)
				.await
			{
				warn!(%user, %new_room, "ghost failed to join new room: {e}");
			}
		}

		let bot = self.services.intent.bot();
		if let Err(e) = bot.leave(old_room, None).await {
			debug!(%old_room, "bot failed to leave old room: {e}");
		}
	}

	async fn joined_members(&self, room_id: &RoomId) -> Result<Vec<ruma::OwnedUserId>> {
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

		let members: Vec<(ruma::OwnedUserId, mxbridge_core::Profile)> =
			fetched.into_iter().collect();
		self.services
			.membership_cache
			.populate_joined(room_id, &members);

		Ok(members.into_iter().map(|(user, _)| user).collect())
	}
}

#[cfg(test)]
mod tests {
	use mxbridge_core::{Membership, Profile, err};
	use ruma::{room_id, user_id};
	use serde_json::json;

	use crate::{
		store::{MatrixRoom, RemoteRoom, RoomEntry},
		test_utils::test_services,
	};

	fn tombstone(old: &str, new: &str, sender: &str) -> mxbridge_core::BridgeEvent {
		serde_json::from_value(json!({
			"event_id": "$tomb:example.org",
			"room_id": old,
			"sender": sender,
			"type": "m.room.tombstone",
			"state_key": "",
			"content": {"body": "upgraded", "replacement_room": new},
		}))
		.unwrap()
	}

	#[tokio::test]
	async fn happy_path_migrates_entries_and_ghosts() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let old = room_id!("!old:example.org");
		let new = room_id!("!new:example.org");
		let ghost = user_id!("@remote_ghost:example.org");

		// two linked entries and one ghost in the old room
		for remote in ["chan-1", "chan-2"] {
			services
				.store
				.rooms
				.upsert_entry(RoomEntry::link(
					MatrixRoom::new(old.to_owned()),
					RemoteRoom::new(remote),
				))
				.await
				.unwrap();
		}
		services.membership_cache.set_membership(
			old,
			ghost,
			Membership::Join,
			Profile::default(),
		);

		services
			.room_upgrade
			.on_tombstone(&tombstone(old.as_str(), new.as_str(), "@u:example.org"))
			.await
			.unwrap();

		// entries moved to the new room id
		let migrated = services
			.store
			.rooms
			.entries_by_matrix_id(new)
			.await
			.unwrap();
		assert_eq!(migrated.len(), 2);
		assert!(services
			.store
			.rooms
			.entries_by_matrix_id(old)
			.await
			.unwrap()
			.is_empty());

		// the hook fired once with the pair
		assert_eq!(
			harness.controller.migrated.lock().unwrap().as_slice(),
			&[(old.to_owned(), new.to_owned())]
		);

		// ghost walked across, bot left the old room
		let calls = harness.mock.calls();
		assert!(calls.contains(&format!("leave {old} {ghost}")));
		assert!(calls.contains(&format!("join {new} {ghost}")));
		assert!(calls.contains(&format!("leave {old} bot")));
	}

	#[tokio::test]
	async fn forbidden_join_waits_for_invite() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let old = room_id!("!old2:example.org");
		let new = room_id!("!new2:example.org");

		services
			.store
			.rooms
			.upsert_entry(RoomEntry::link(
				MatrixRoom::new(old.to_owned()),
				RemoteRoom::new("chan"),
			))
			.await
			.unwrap();

		harness
			.mock
			.fail_next(&format!("join {new} bot"), err!(Request(Forbidden("invite only"))));

		services
			.room_upgrade
			.on_tombstone(&tombstone(old.as_str(), new.as_str(), "@u:example.org"))
			.await
			.unwrap();

		assert!(services.room_upgrade.has_pending_invite(new));
		assert!(harness.controller.migrated.lock().unwrap().is_empty());

		// the awaited invite arrives and the migration completes
		services.room_upgrade.on_invite(new).await.unwrap();
		assert!(!services.room_upgrade.has_pending_invite(new));
		assert_eq!(harness.controller.migrated.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn unrelated_invites_are_ignored() {
		let harness = test_services().await;
		let services = &harness.services.services;

		services
			.room_upgrade
			.on_invite(room_id!("!random:example.org"))
			.await
			.unwrap();

		assert!(harness.controller.migrated.lock().unwrap().is_empty());
		assert_eq!(harness.mock.call_count("join"), 0);
	}

	#[tokio::test]
	async fn transient_join_failure_abandons_without_pending() {
		let harness = test_services().await;
		let services = &harness.services.services;
		let old = room_id!("!old3:example.org");
		let new = room_id!("!new3:example.org");

		harness
			.mock
			.fail_next(&format!("join {new} bot"), err!(UpstreamTimeout("network")));

		services
			.room_upgrade
			.on_tombstone(&tombstone(old.as_str(), new.as_str(), "@u:example.org"))
			.await
			.unwrap();

		assert!(!services.room_upgrade.has_pending_invite(new));
	}
}
