mod namespace_regex;

use std::sync::Arc;

use mxbridge_core::{Result, Server};
use ruma::{OwnedUserId, RoomAliasId, RoomId, ServerName, UserId};

pub use self::namespace_regex::NamespaceRegex;

/// Bridge identity: the registration's namespaces compiled, plus the bot
/// user. Everything that asks "is this ours?" asks here.
pub struct Service {
	server: Arc<Server>,
	bot_user_id: OwnedUserId,
	pub users: NamespaceRegex,
	pub aliases: NamespaceRegex,
	pub rooms: NamespaceRegex,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		let registration = &args.server.registration;

		Ok(Arc::new(Self {
			server: args.server.clone(),
			bot_user_id: args.server.bot_user_id(),
			users: NamespaceRegex::compile(&registration.namespaces.users)?,
			aliases: NamespaceRegex::compile(&registration.namespaces.aliases)?,
			rooms: NamespaceRegex::compile(&registration.namespaces.rooms)?,
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	#[inline]
	#[must_use]
	pub fn server_name(&self) -> &ServerName { &self.server.name }

	#[inline]
	#[must_use]
	pub fn bot_user_id(&self) -> &UserId { &self.bot_user_id }

	#[inline]
	#[must_use]
	pub fn is_bot(&self, user_id: &UserId) -> bool { user_id == self.bot_user_id }

	/// A ghost: matches an exclusive user namespace and is not the bot.
	#[must_use]
	pub fn is_virtual_user(&self, user_id: &UserId) -> bool {
		!self.is_bot(user_id)
			&& self
				.users
				.is_exclusive_match(user_id.as_str())
	}

	/// The bot or any ghost.
	#[inline]
	#[must_use]
	pub fn is_our_user(&self, user_id: &UserId) -> bool {
		self.is_bot(user_id) || self.is_virtual_user(user_id)
	}

	#[must_use]
	pub fn is_our_alias(&self, alias: &RoomAliasId) -> bool {
		self.aliases.is_match(alias.as_str())
	}

	#[must_use]
	pub fn is_our_room(&self, room_id: &RoomId) -> bool {
		self.rooms.is_match(room_id.as_str())
	}
}

#[cfg(test)]
mod tests {
	use ruma::user_id;

	use crate::test_utils::test_services;

	#[tokio::test]
	async fn virtual_users_match_exclusive_namespace() {
		let harness = test_services().await;
		let globals = &harness.services.services.globals;

		assert!(globals.is_virtual_user(user_id!("@remote_alice:example.org")));
		assert!(!globals.is_virtual_user(user_id!("@alice:example.org")));

		// the bot is ours but not a ghost
		let bot = globals.bot_user_id().to_owned();
		assert!(!globals.is_virtual_user(&bot));
		assert!(globals.is_our_user(&bot));
	}
}
