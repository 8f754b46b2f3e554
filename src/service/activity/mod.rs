//! Online-presence resolution for single users. The ladder: our own
//! last-active bookkeeping, then homeserver presence, then the Synapse
//! admin whois API when it answers at all, then the configured default.

use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use mxbridge_core::{Result, debug, utils::millis_since_unix_epoch};
use ruma::{OwnedUserId, UserId};
use tokio::sync::OnceCell;

use crate::services::OnceServices;

/// Outcome of an online probe: whether the user counts as online, and how
/// long ago they were seen when that is known.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Online {
	pub online: bool,
	pub inactive_ms: Option<u64>,
}

pub struct Service {
	last_active: RwLock<HashMap<OwnedUserId, u64>>,
	admin_api: OnceCell<bool>,
	services: Arc<OnceServices>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			last_active: RwLock::new(HashMap::new()),
			admin_api: OnceCell::new(),
			services: args.services.clone(),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	pub fn set_last_active_time(&self, user_id: &UserId) {
		self.last_active
			.write()
			.expect("activity lock")
			.insert(user_id.to_owned(), millis_since_unix_epoch());
	}

	fn local_age_ms(&self, user_id: &UserId) -> Option<u64> {
		self.last_active
			.read()
			.expect("activity lock")
			.get(user_id)
			.map(|ts| millis_since_unix_epoch().saturating_sub(*ts))
	}

	/// Whether the admin API answers; probed once per process lifetime.
	async fn admin_api_reachable(&self) -> bool {
		*self
			.admin_api
			.get_or_init(|| async {
				self.services
					.client
					.admin_probe()
					.await
					.unwrap_or(false)
			})
			.await
	}

	pub async fn is_user_online(&self, user_id: &UserId) -> Result<Online> {
		let config = self.services.server.config.get();
		let max_ms = config.activity_window_ms;

		// rung 1: our own observations
		if let Some(age) = self.local_age_ms(user_id) {
			if age < max_ms {
				return Ok(Online { online: true, inactive_ms: Some(age) });
			}
		}

		// rung 2: homeserver presence
		if config.presence_enabled {
			match self.services.client.presence(user_id).await {
				| Ok(status) => {
					if status.currently_active == Some(true) || status.presence == "online" {
						return Ok(Online { online: true, inactive_ms: Some(0) });
					}
					if let Some(ago) = status.last_active_ago {
						if ago > max_ms {
							return Ok(Online { online: false, inactive_ms: Some(ago) });
						}
						return Ok(Online { online: true, inactive_ms: Some(ago) });
					}
					// inconclusive, keep descending
				},
				| Err(e) => debug!(user = %user_id, "presence probe failed: {e}"),
			}
		}

		// rung 3: admin whois for local users
		if user_id.server_name() == self.services.globals.server_name()
			&& self.admin_api_reachable().await
		{
			if let Ok(whois) = self.services.client.whois(user_id).await {
				if let Some(last_seen) = whois.last_seen() {
					let age = millis_since_unix_epoch().saturating_sub(last_seen);
					return Ok(Online { online: age < max_ms, inactive_ms: Some(age) });
				}
			}
		}

		// rung 4: the configured fallback
		Ok(Online {
			online: config.activity_default_online,
			inactive_ms: None,
		})
	}
}

#[cfg(test)]
mod tests {
	use mxbridge_client::{PresenceStatus, WhoisInfo};
	use ruma::user_id;

	use crate::test_utils::{test_services, test_services_with};

	#[tokio::test]
	async fn local_observation_wins() {
		let harness = test_services().await;
		let activity = &harness.services.services.activity;
		let user = user_id!("@seen:example.org");

		activity.set_last_active_time(user);
		let online = activity.is_user_online(user).await.unwrap();
		assert!(online.online);
		assert!(online.inactive_ms.unwrap() < 1_000);
		assert_eq!(harness.mock.call_count("presence"), 0);
	}

	#[tokio::test]
	async fn presence_is_consulted_when_enabled() {
		let harness = test_services_with(|config| {
			config.presence_enabled = true;
		})
		.await;
		let activity = &harness.services.services.activity;
		let user = user_id!("@busy:example.org");

		harness.mock.set_presence_status(user, PresenceStatus {
			presence: "unavailable".to_owned(),
			currently_active: None,
			last_active_ago: Some(10 * 60 * 1000),
			status_msg: None,
		});

		let online = activity.is_user_online(user).await.unwrap();
		assert!(!online.online);
		assert_eq!(online.inactive_ms, Some(10 * 60 * 1000));
	}

	#[tokio::test]
	async fn whois_breaks_ties_for_local_users() {
		let harness = test_services().await;
		let activity = &harness.services.services.activity;
		let user = user_id!("@wired:example.org");

		harness.mock.set_admin_api(true);
		harness.mock.set_whois(
			user,
			serde_json::from_value::<WhoisInfo>(serde_json::json!({
				"user_id": user.as_str(),
				"devices": {"": {"sessions": [{"connections": [
					{"ip": "10.0.0.1", "last_seen": mxbridge_core::utils::millis_since_unix_epoch() - 1000},
				]}]}},
			}))
			.unwrap(),
		);

		let online = activity.is_user_online(user).await.unwrap();
		assert!(online.online);

		// the admin probe only ever fires once
		activity.is_user_online(user).await.unwrap();
		assert_eq!(harness.mock.call_count("admin_probe"), 1);
	}

	#[tokio::test]
	async fn falls_back_to_configured_default() {
		let harness = test_services_with(|config| {
			config.activity_default_online = true;
		})
		.await;
		let activity = &harness.services.services.activity;

		let online = activity
			.is_user_online(user_id!("@stranger:elsewhere.org"))
			.await
			.unwrap();
		assert!(online.online);
		assert_eq!(online.inactive_ms, None);
	}
}
