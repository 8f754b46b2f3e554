//! Intent backing stores. The backing answers "what do we already know"
//! about membership, profiles and power levels, so intents skip redundant
//! round trips. The local flavor records only its own user; the cache
//! flavor shares the bridge-wide membership cache and records everyone.

use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use mxbridge_core::{Membership, PowerLevelsContent, Profile};
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};

use crate::membership_cache;

pub trait IntentBacking: Send + Sync {
	fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Membership;
	fn member_profile(&self, room_id: &RoomId, user_id: &UserId) -> Profile;
	fn power_levels(&self, room_id: &RoomId) -> Option<PowerLevelsContent>;
	fn set_membership(
		&self,
		room_id: &RoomId,
		user_id: &UserId,
		membership: Membership,
		profile: Profile,
	);
	fn set_power_levels(&self, room_id: &RoomId, content: PowerLevelsContent);
	fn is_registered(&self, user_id: &UserId) -> bool;
	fn mark_registered(&self, user_id: &UserId);
}

/// Process-local backing for a standalone intent; only its own user's
/// memberships are recorded.
pub struct LocalBacking {
	user_id: OwnedUserId,
	memberships: RwLock<HashMap<OwnedRoomId, (Membership, Profile)>>,
	power_levels: RwLock<HashMap<OwnedRoomId, PowerLevelsContent>>,
	registered: RwLock<bool>,
}

impl LocalBacking {
	#[must_use]
	pub fn new(user_id: OwnedUserId) -> Self {
		Self {
			user_id,
			memberships: RwLock::new(HashMap::new()),
			power_levels: RwLock::new(HashMap::new()),
			registered: RwLock::new(false),
		}
	}
}

impl IntentBacking for LocalBacking {
	fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Membership {
		if user_id != self.user_id {
			return Membership::Unknown;
		}

		self.memberships
			.read()
			.expect("backing lock")
			.get(room_id)
			.map_or(Membership::Unknown, |(membership, _)| *membership)
	}

	fn member_profile(&self, room_id: &RoomId, user_id: &UserId) -> Profile {
		if user_id != self.user_id {
			return Profile::default();
		}

		self.memberships
			.read()
			.expect("backing lock")
			.get(room_id)
			.map(|(_, profile)| profile.clone())
			.unwrap_or_default()
	}

	fn power_levels(&self, room_id: &RoomId) -> Option<PowerLevelsContent> {
		self.power_levels
			.read()
			.expect("backing lock")
			.get(room_id)
			.cloned()
	}

	fn set_membership(
		&self,
		room_id: &RoomId,
		user_id: &UserId,
		membership: Membership,
		profile: Profile,
	) {
		if user_id != self.user_id {
			return;
		}

		self.memberships
			.write()
			.expect("backing lock")
			.insert(room_id.to_owned(), (membership, profile));
	}

	fn set_power_levels(&self, room_id: &RoomId, content: PowerLevelsContent) {
		self.power_levels
			.write()
			.expect("backing lock")
			.insert(room_id.to_owned(), content);
	}

	fn is_registered(&self, user_id: &UserId) -> bool {
		user_id == self.user_id && *self.registered.read().expect("backing lock")
	}

	fn mark_registered(&self, user_id: &UserId) {
		if user_id == self.user_id {
			*self.registered.write().expect("backing lock") = true;
		}
	}
}

/// Backing over the shared membership cache; records all users.
pub struct CacheBacking {
	cache: Arc<membership_cache::Service>,
}

impl CacheBacking {
	#[must_use]
	pub fn new(cache: Arc<membership_cache::Service>) -> Self { Self { cache } }
}

impl IntentBacking for CacheBacking {
	fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Membership {
		self.cache.membership(room_id, user_id)
	}

	fn member_profile(&self, room_id: &RoomId, user_id: &UserId) -> Profile {
		self.cache.member_profile(room_id, user_id)
	}

	fn power_levels(&self, room_id: &RoomId) -> Option<PowerLevelsContent> {
		self.cache.power_levels(room_id)
	}

	fn set_membership(
		&self,
		room_id: &RoomId,
		user_id: &UserId,
		membership: Membership,
		profile: Profile,
	) {
		self.cache
			.set_membership(room_id, user_id, membership, profile);
	}

	fn set_power_levels(&self, room_id: &RoomId, content: PowerLevelsContent) {
		self.cache.set_power_levels(room_id, content);
	}

	fn is_registered(&self, user_id: &UserId) -> bool { self.cache.is_registered(user_id) }

	fn mark_registered(&self, user_id: &UserId) { self.cache.mark_registered(user_id); }
}
