//! Hot-reloadable allow/deny ruleset over joined members, consulted before
//! a room is linked to a remote channel. Conflicting rooms are remembered
//! for a while so repeated provisioning attempts fail fast.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex, RwLock},
};

use mxbridge_core::{Result, debug, info, utils::millis_since_unix_epoch};
use ruma::{OwnedRoomId, RoomId};
use serde::Deserialize;

use crate::services::OnceServices;

const CONFLICT_CACHE_MS: u64 = 30 * 60 * 1000;

/// Rule file shape: `{ userIds: { exempt: [regex], conflict: [regex] } }`.
#[derive(Debug, Default, Deserialize)]
pub struct Rules {
	#[serde(default, rename = "userIds")]
	pub user_ids: UserIdRules,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserIdRules {
	#[serde(default, with = "serde_regex")]
	pub exempt: Vec<regex::Regex>,

	#[serde(default, with = "serde_regex")]
	pub conflict: Vec<regex::Regex>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validation {
	Passed,
	ErrorCached,
	ErrorUserConflict,
}

pub struct Service {
	rules: RwLock<Rules>,
	conflict_cache: Mutex<HashMap<OwnedRoomId, u64>>,
	services: Arc<OnceServices>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		let config = args.server.config.get();
		let rules = config
			.room_link_validation
			.as_ref()
			.and_then(|link| link.rules.clone())
			.map(serde_json::from_value)
			.transpose()?
			.unwrap_or_default();

		Ok(Arc::new(Self {
			rules: RwLock::new(rules),
			conflict_cache: Mutex::new(HashMap::new()),
			services: args.services.clone(),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	/// Replace the compiled ruleset. The conflict cache deliberately stays:
	/// a higher-level caller decides when past verdicts stop being relevant.
	pub fn update_rules(&self, rules: Rules) {
		info!(
			exempt = rules.user_ids.exempt.len(),
			conflict = rules.user_ids.conflict.len(),
			"room-link validation rules updated"
		);
		*self.rules.write().expect("rules lock") = rules;
	}

	pub fn clear_conflict_cache(&self) {
		self.conflict_cache
			.lock()
			.expect("conflict lock")
			.clear();
	}

	pub async fn validate_room(&self, room_id: &RoomId) -> Result<Validation> {
		{
			let cache = self.conflict_cache.lock().expect("conflict lock");
			if let Some(recorded) = cache.get(room_id) {
				if millis_since_unix_epoch().saturating_sub(*recorded) <= CONFLICT_CACHE_MS {
					return Ok(Validation::ErrorCached);
				}
			}
		}

		let members = self
			.services
			.client
			.joined_members(None, room_id)
			.await?;

		let rules = self.rules.read().expect("rules lock");
		for user in members.keys() {
			let user_str = user.as_str();
			if rules
				.user_ids
				.exempt
				.iter()
				.any(|re| re.is_match(user_str))
			{
				continue;
			}

			if rules
				.user_ids
				.conflict
				.iter()
				.any(|re| re.is_match(user_str))
			{
				debug!(room = %room_id, %user, "room link rejected by conflict rule");
				drop(rules);
				self.conflict_cache
					.lock()
					.expect("conflict lock")
					.insert(room_id.to_owned(), millis_since_unix_epoch());
				return Ok(Validation::ErrorUserConflict);
			}
		}

		Ok(Validation::Passed)
	}
}

#[cfg(test)]
mod tests {
	use mxbridge_core::Profile;
	use ruma::{room_id, user_id};
	use serde_json::json;

	use super::{Rules, Validation};
	use crate::test_utils::test_services_with;

	fn rules(exempt: &[&str], conflict: &[&str]) -> Rules {
		serde_json::from_value(json!({
			"userIds": { "exempt": exempt, "conflict": conflict }
		}))
		.unwrap()
	}

	fn with_rules(config: &mut mxbridge_core::Config) {
		config.room_link_validation = Some(
			serde_json::from_value(json!({
				"rules": {
					"userIds": {
						"exempt": ["@goodbot:.*"],
						"conflict": ["@.*bot:.*"],
					}
				}
			}))
			.unwrap(),
		);
	}

	#[tokio::test]
	async fn conflicting_member_fails_the_room() {
		let harness = test_services_with(with_rules).await;
		let validator = &harness.services.services.link_validator;
		let room = room_id!("!candidate:example.org");

		harness
			.mock
			.set_joined(room, user_id!("@human:example.org"), Profile::default());
		harness
			.mock
			.set_joined(room, user_id!("@otherbot:example.org"), Profile::default());

		assert_eq!(
			validator.validate_room(room).await.unwrap(),
			Validation::ErrorUserConflict
		);

		// cached verdict short-circuits the member fetch
		let fetches = harness.mock.call_count("joined_members");
		assert_eq!(
			validator.validate_room(room).await.unwrap(),
			Validation::ErrorCached
		);
		assert_eq!(harness.mock.call_count("joined_members"), fetches);
	}

	#[tokio::test]
	async fn exempt_beats_conflict() {
		let harness = test_services_with(with_rules).await;
		let validator = &harness.services.services.link_validator;
		let room = room_id!("!fine:example.org");

		harness
			.mock
			.set_joined(room, user_id!("@goodbot:example.org"), Profile::default());

		assert_eq!(validator.validate_room(room).await.unwrap(), Validation::Passed);
	}

	#[tokio::test]
	async fn rule_updates_keep_the_conflict_cache() {
		let harness = test_services_with(with_rules).await;
		let validator = &harness.services.services.link_validator;
		let room = room_id!("!sticky:example.org");

		harness
			.mock
			.set_joined(room, user_id!("@otherbot:example.org"), Profile::default());
		assert_eq!(
			validator.validate_room(room).await.unwrap(),
			Validation::ErrorUserConflict
		);

		// clearing the rules does not clear the remembered conflict
		validator.update_rules(rules(&[], &[]));
		assert_eq!(
			validator.validate_room(room).await.unwrap(),
			Validation::ErrorCached
		);

		validator.clear_conflict_cache();
		assert_eq!(validator.validate_room(room).await.unwrap(), Validation::Passed);
	}
}
