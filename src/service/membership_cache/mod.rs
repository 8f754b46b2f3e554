//! In-process projection of room membership as observed from transactions
//! and our own actions. Also tracks which user IDs have ever been seen with
//! a `join` or `leave` anywhere: those are known-registered and need no
//! register round trip.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, RwLock},
};

use mxbridge_core::{MemberContent, Membership, PowerLevelsContent, Profile, Result};
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};

#[derive(Clone, Debug, Default)]
pub struct MemberInfo {
	pub membership: Membership,
	pub profile: Profile,
}

pub struct Service {
	rooms: RwLock<HashMap<OwnedRoomId, HashMap<OwnedUserId, MemberInfo>>>,
	registered: RwLock<HashSet<OwnedUserId>>,
	power_levels: RwLock<HashMap<OwnedRoomId, PowerLevelsContent>>,
}

impl crate::Service for Service {
	fn build(_: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			rooms: RwLock::new(HashMap::new()),
			registered: RwLock::new(HashSet::new()),
			power_levels: RwLock::new(HashMap::new()),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	pub fn set_membership(
		&self,
		room_id: &RoomId,
		user_id: &UserId,
		membership: Membership,
		profile: Profile,
	) {
		self.rooms
			.write()
			.expect("cache lock")
			.entry(room_id.to_owned())
			.or_default()
			.insert(user_id.to_owned(), MemberInfo { membership, profile });

		if membership.implies_registered() {
			self.mark_registered(user_id);
		}
	}

	/// Apply an `m.room.member` state event.
	pub fn on_member_event(&self, room_id: &RoomId, target: &UserId, content: &MemberContent) {
		self.set_membership(room_id, target, content.membership, Profile {
			displayname: content.displayname.clone(),
			avatar_url: content.avatar_url.clone(),
		});
	}

	#[must_use]
	pub fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Membership {
		self.rooms
			.read()
			.expect("cache lock")
			.get(room_id)
			.and_then(|members| members.get(user_id))
			.map_or(Membership::Unknown, |info| info.membership)
	}

	#[must_use]
	pub fn member_profile(&self, room_id: &RoomId, user_id: &UserId) -> Profile {
		self.rooms
			.read()
			.expect("cache lock")
			.get(room_id)
			.and_then(|members| members.get(user_id))
			.map(|info| info.profile.clone())
			.unwrap_or_default()
	}

	#[inline]
	#[must_use]
	pub fn is_joined(&self, room_id: &RoomId, user_id: &UserId) -> bool {
		self.membership(room_id, user_id) == Membership::Join
	}

	/// Joined members of a room, if we have seen the room at all.
	#[must_use]
	pub fn joined_members(&self, room_id: &RoomId) -> Option<Vec<OwnedUserId>> {
		let rooms = self.rooms.read().expect("cache lock");
		let members = rooms.get(room_id)?;

		Some(
			members
				.iter()
				.filter(|(_, info)| info.membership == Membership::Join)
				.map(|(user, _)| user.clone())
				.collect(),
		)
	}

	/// Bulk-populate a room's joined membership from a `joined_members`
	/// response.
	pub fn populate_joined(&self, room_id: &RoomId, members: &[(OwnedUserId, Profile)]) {
		let mut rooms = self.rooms.write().expect("cache lock");
		let room = rooms.entry(room_id.to_owned()).or_default();
		for (user, profile) in members {
			room.insert(user.clone(), MemberInfo {
				membership: Membership::Join,
				profile: profile.clone(),
			});
		}
		drop(rooms);

		for (user, _) in members {
			self.mark_registered(user);
		}
	}

	pub fn mark_registered(&self, user_id: &UserId) {
		self.registered
			.write()
			.expect("cache lock")
			.insert(user_id.to_owned());
	}

	#[must_use]
	pub fn is_registered(&self, user_id: &UserId) -> bool {
		self.registered
			.read()
			.expect("cache lock")
			.contains(user_id)
	}

	pub fn set_power_levels(&self, room_id: &RoomId, content: PowerLevelsContent) {
		self.power_levels
			.write()
			.expect("cache lock")
			.insert(room_id.to_owned(), content);
	}

	#[must_use]
	pub fn power_levels(&self, room_id: &RoomId) -> Option<PowerLevelsContent> {
		self.power_levels
			.read()
			.expect("cache lock")
			.get(room_id)
			.cloned()
	}

	/// Drop everything known about a room (used after upgrades).
	pub fn forget_room(&self, room_id: &RoomId) {
		self.rooms
			.write()
			.expect("cache lock")
			.remove(room_id);
		self.power_levels
			.write()
			.expect("cache lock")
			.remove(room_id);
	}
}

#[cfg(test)]
mod tests {
	use mxbridge_core::{Membership, Profile};
	use ruma::{room_id, user_id};

	use crate::test_utils::test_services;

	#[tokio::test]
	async fn join_and_leave_imply_registration() {
		let harness = test_services().await;
		let cache = &harness.services.services.membership_cache;

		let room = room_id!("!r:example.org");
		let joiner = user_id!("@a:example.org");
		let leaver = user_id!("@b:example.org");
		let invitee = user_id!("@c:example.org");

		cache.set_membership(room, joiner, Membership::Join, Profile::default());
		cache.set_membership(room, leaver, Membership::Leave, Profile::default());
		cache.set_membership(room, invitee, Membership::Invite, Profile::default());

		assert!(cache.is_registered(joiner));
		assert!(cache.is_registered(leaver));
		assert!(!cache.is_registered(invitee));

		assert!(cache.is_joined(room, joiner));
		assert_eq!(cache.membership(room, invitee), Membership::Invite);
		assert_eq!(
			cache.membership(room_id!("!other:example.org"), joiner),
			Membership::Unknown
		);
	}
}
