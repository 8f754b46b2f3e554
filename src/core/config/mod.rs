mod manager;
pub mod registration;

use std::{
	net::{IpAddr, Ipv4Addr},
	path::{Path, PathBuf},
};

use figment::{
	Figment,
	providers::{Env, Format, Yaml},
};
use ruma::{OwnedRoomId, OwnedServerName};
use serde::Deserialize;
use url::Url;

pub use self::{manager::Manager, registration::Registration};
use crate::{Result, err};

/// Bridge configuration, loaded from YAML with environment overrides.
/// Optional subsystems are whole optional sections; everything else defaults.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
	/// Base URL of the homeserver's client-server API.
	pub homeserver_url: Url,

	/// The server name whose users this bridge puppets.
	pub server_name: OwnedServerName,

	/// Separate URL for media downloads; falls back to `homeserver_url`.
	#[serde(default)]
	pub media_url: Option<Url>,

	#[serde(default = "default_address")]
	pub address: IpAddr,

	#[serde(default = "default_port")]
	pub port: u16,

	#[serde(default = "default_log")]
	pub log: String,

	#[serde(default)]
	pub event_queue: EventQueueFlavor,

	/// Emit `de.nasnotfound.bridge_error` messages into bridged rooms when a
	/// handler rejects an event.
	#[serde(default)]
	pub emit_bridge_errors: bool,

	/// Client-level timeout applied to ordinary homeserver calls.
	#[serde(default = "default_request_timeout_ms")]
	pub request_timeout_ms: u64,

	// Intent
	#[serde(default = "default_intent_ttl_ms")]
	pub intent_cull_after_ms: u64,
	#[serde(default = "default_intent_cache")]
	pub intent_cache_size: usize,

	// Membership queue
	#[serde(default = "default_concurrent_room_limit")]
	pub concurrent_room_limit: usize,
	#[serde(default = "default_max_attempts")]
	pub membership_max_attempts: u32,
	#[serde(default = "default_action_delay_ms")]
	pub action_delay_ms: u64,
	#[serde(default = "default_max_action_delay_ms")]
	pub max_action_delay_ms: u64,
	#[serde(default = "default_membership_ttl_ms")]
	pub membership_ttl_ms: u64,

	// State lookup
	#[serde(default = "default_state_lookup_concurrency")]
	pub state_lookup_concurrency: usize,
	#[serde(default = "default_state_retry_ms")]
	pub state_retry_ms: u64,

	// Activity tracking
	#[serde(default)]
	pub presence_enabled: bool,
	#[serde(default = "default_activity_window_ms")]
	pub activity_window_ms: u64,
	#[serde(default)]
	pub activity_default_online: bool,
	#[serde(default = "default_min_user_active_days")]
	pub min_user_active_days: u32,
	#[serde(default = "default_inactive_after_days")]
	pub inactive_after_days: u32,
	#[serde(default = "default_activity_debounce_ms")]
	pub activity_debounce_ms: u64,

	/// Maximum user count before the bridge blocks itself; absent disables
	/// the blocker.
	#[serde(default)]
	pub user_limit: Option<u64>,

	#[serde(default)]
	pub room_upgrade: RoomUpgradeConfig,

	#[serde(default)]
	pub ban_sync: Option<BanSyncConfig>,

	#[serde(default)]
	pub media_proxy: Option<MediaProxyConfig>,

	#[serde(default)]
	pub service_room: Option<ServiceRoomConfig>,

	#[serde(default)]
	pub room_link_validation: Option<LinkValidationConfig>,

	#[serde(default)]
	pub encryption: Option<EncryptionConfig>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventQueueFlavor {
	None,
	#[default]
	Single,
	PerRoom,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RoomUpgradeConfig {
	/// Follow `m.room.tombstone` events into replacement rooms.
	#[serde(default = "default_true")]
	pub enabled: bool,

	/// Move ghost users from the old room into the new one.
	#[serde(default = "default_true")]
	pub migrate_ghosts: bool,

	/// Rewrite room-store entries onto the new room id.
	#[serde(default = "default_true")]
	pub migrate_store_entries: bool,
}

impl Default for RoomUpgradeConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			migrate_ghosts: true,
			migrate_store_entries: true,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct BanSyncConfig {
	/// Policy-rule rooms to join and watch.
	pub rooms: Vec<OwnedRoomId>,

	/// Probe `POST /register` on unknown homeservers and block users from
	/// servers with open registration.
	#[serde(default)]
	pub block_open_registration: bool,

	/// Also block when the probe result is inconclusive.
	#[serde(default)]
	pub allow_unknown: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MediaProxyConfig {
	/// HMAC-SHA-512 signing key for media tokens.
	pub signing_key: String,

	/// Public base URL the signed media links are issued under.
	pub public_url: Url,

	/// Token lifetime; absent tokens never expire.
	#[serde(default)]
	pub ttl_ms: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServiceRoomConfig {
	pub room: OwnedRoomId,

	#[serde(default = "default_notice_prefix")]
	pub prefix: String,

	#[serde(default = "default_notice_period_ms")]
	pub minimum_update_period_ms: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LinkValidationConfig {
	/// Rule file reloaded on SIGHUP.
	#[serde(default)]
	pub rule_file: Option<PathBuf>,

	/// Inline rules, used when no rule file is configured.
	#[serde(default)]
	pub rules: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EncryptionConfig {
	/// Homeserver (or pantalaimon-style decrypting proxy) the per-user
	/// encrypted syncs run against.
	pub sync_url: Url,
}

impl Config {
	/// Load configuration from an optional YAML file plus `MXBRIDGE_*`
	/// environment overrides.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let mut figment = Figment::new();
		if let Some(path) = path {
			figment = figment.merge(Yaml::file(path));
		}

		let config: Self = figment
			.merge(Env::prefixed("MXBRIDGE_").split("__"))
			.extract()?;

		config.check()?;
		Ok(config)
	}

	pub fn check(&self) -> Result {
		if !matches!(self.homeserver_url.scheme(), "http" | "https") {
			return Err(err!(Config(
				"homeserver_url",
				"scheme must be http or https, not {:?}",
				self.homeserver_url.scheme()
			)));
		}

		if self.concurrent_room_limit == 0 {
			return Err(err!(Config("concurrent_room_limit", "must be at least 1")));
		}

		if self.membership_max_attempts == 0 {
			return Err(err!(Config("membership_max_attempts", "must be at least 1")));
		}

		if self.min_user_active_days > 31 {
			return Err(err!(Config(
				"min_user_active_days",
				"activity records hold at most 31 days"
			)));
		}

		if let Some(media) = &self.media_proxy
			&& media.signing_key.is_empty()
		{
			return Err(err!(Config("media_proxy.signing_key", "must not be empty")));
		}

		Ok(())
	}
}

fn default_true() -> bool { true }

fn default_address() -> IpAddr { IpAddr::V4(Ipv4Addr::LOCALHOST) }

fn default_port() -> u16 { 8090 }

fn default_log() -> String { "info".to_owned() }

fn default_request_timeout_ms() -> u64 { 2 * 60 * 1000 }

fn default_intent_ttl_ms() -> u64 { 10 * 60 * 1000 }

fn default_intent_cache() -> usize { 1024 }

fn default_concurrent_room_limit() -> usize { 8 }

fn default_max_attempts() -> u32 { 10 }

fn default_action_delay_ms() -> u64 { 500 }

fn default_max_action_delay_ms() -> u64 { 30 * 60 * 1000 }

fn default_membership_ttl_ms() -> u64 { 2 * 60 * 1000 }

fn default_state_lookup_concurrency() -> usize { 4 }

fn default_state_retry_ms() -> u64 { 300 }

fn default_activity_window_ms() -> u64 { 5 * 60 * 1000 }

fn default_min_user_active_days() -> u32 { 3 }

fn default_inactive_after_days() -> u32 { 31 }

fn default_activity_debounce_ms() -> u64 { 10 * 1000 }

fn default_notice_prefix() -> String { "service".to_owned() }

fn default_notice_period_ms() -> u64 { 60 * 60 * 1000 }

#[cfg(test)]
mod tests {
	use super::Config;

	fn minimal() -> Config {
		serde_json::from_value(serde_json::json!({
			"homeserver_url": "https://matrix.example.org",
			"server_name": "example.org",
		}))
		.unwrap()
	}

	#[test]
	fn defaults_fill_in() {
		let config = minimal();
		assert_eq!(config.port, 8090);
		assert_eq!(config.concurrent_room_limit, 8);
		assert_eq!(config.membership_max_attempts, 10);
		assert_eq!(config.max_action_delay_ms, 30 * 60 * 1000);
		assert!(config.ban_sync.is_none());
		config.check().unwrap();
	}

	#[test]
	fn rejects_zero_shards() {
		let mut config = minimal();
		config.concurrent_room_limit = 0;
		assert!(config.check().is_err());
	}
}
