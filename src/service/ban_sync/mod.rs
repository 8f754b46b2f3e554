//! Policy-rule evaluation and open-registration probing. The bridge joins
//! each configured policy room, ingests its ban rules, and answers "is this
//! user admitted" for the inbound event path.

pub mod open_registration;

use std::{
	collections::HashMap,
	sync::{Arc, Mutex, RwLock},
};

use async_trait::async_trait;
use mxbridge_core::{
	BridgeEvent, Result, debug, err,
	utils::{Glob, millis_since_unix_epoch, rand::jitter_signed_ms},
	warn,
};
use ruma::{OwnedRoomId, RoomId, UserId};
use serde::Deserialize;

use self::open_registration::{Registration, classify};
use crate::services::OnceServices;

const POLICY_TYPES: &[&str] = &[
	"m.policy.rule.user",
	"m.policy.rule.server",
	"org.matrix.mjolnir.rule.user",
	"org.matrix.mjolnir.rule.server",
];

const BAN_RECOMMENDATIONS: &[&str] = &["m.ban", "org.matrix.mjolnir.ban"];

const VERDICT_TTL_MS: u64 = 30 * 60 * 1000;
const VERDICT_JITTER_MS: u64 = 60 * 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleKind {
	User,
	Server,
}

pub struct BanRule {
	pub kind: RuleKind,
	pub matcher: Glob,
	pub reason: String,
}

/// Why a user was refused.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BanVerdict {
	Rule { reason: String },
	OpenRegistration { host: String },
}

#[derive(Deserialize)]
struct PolicyRuleContent {
	entity: Option<String>,
	#[serde(default)]
	reason: Option<String>,
	#[serde(default)]
	recommendation: Option<String>,
}

pub struct Service {
	rules: RwLock<HashMap<(OwnedRoomId, String), BanRule>>,
	verdicts: Mutex<HashMap<String, (Registration, u64)>>,
	services: Arc<OnceServices>,
}

#[async_trait]
impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			rules: RwLock::new(HashMap::new()),
			verdicts: Mutex::new(HashMap::new()),
			services: args.services.clone(),
		}))
	}

	/// Join the configured policy rooms and ingest their rules.
	async fn worker(self: Arc<Self>) -> Result {
		self.resync().await;
		Ok(())
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	fn policy_rooms(&self) -> Vec<OwnedRoomId> {
		self.services
			.server
			.config
			.get()
			.ban_sync
			.as_ref()
			.map(|b| b.rooms.clone())
			.unwrap_or_default()
	}

	/// Re-join and re-read every configured policy room; also the config
	/// reload path.
	pub async fn resync(&self) {
		for room_id in self.policy_rooms() {
			if let Err(e) = self.sync_policy_room(&room_id).await {
				warn!(room = %room_id, "failed to sync policy room: {e}");
			}
		}
	}

	pub async fn sync_policy_room(&self, room_id: &RoomId) -> Result {
		let bot = self.services.intent.bot();
		bot.ensure_joined(room_id).await?;

		let state = bot.room_state(room_id, false).await?;
		for event in state {
			if let Err(e) = self.handle_event(&event) {
				debug!(room = %room_id, event = %event.event_id, "skipped policy event: {e}");
			}
		}

		Ok(())
	}

	#[must_use]
	pub fn is_policy_room(&self, room_id: &RoomId) -> bool {
		self.policy_rooms().iter().any(|r| r == room_id)
	}

	/// Ingest a policy-rule state event. Absent `entity` deletes the rule at
	/// `(room, state_key)`; an empty entity is a hard error.
	pub fn handle_event(&self, event: &BridgeEvent) -> Result {
		if !POLICY_TYPES.contains(&event.kind.as_str()) {
			return Ok(());
		}

		let Some(room_id) = event.room_id.clone() else {
			return Ok(());
		};
		let Some(state_key) = event.state_key.clone() else {
			return Ok(());
		};

		let kind = if event.kind.ends_with(".user") { RuleKind::User } else { RuleKind::Server };

		let content: PolicyRuleContent = serde_json::from_value(event.content.clone())?;
		let Some(entity) = content.entity else {
			self.rules
				.write()
				.expect("rules lock")
				.remove(&(room_id, state_key));
			return Ok(());
		};

		if entity.is_empty() {
			return Err(err!(BadValue("policy rule with empty entity")));
		}

		let recommendation = content.recommendation.unwrap_or_default();
		if !BAN_RECOMMENDATIONS.contains(&recommendation.as_str()) {
			debug!(%recommendation, "ignoring non-ban policy recommendation");
			return Ok(());
		}

		let rule = BanRule {
			kind,
			matcher: Glob::new(&entity)?,
			reason: content.reason.unwrap_or_default(),
		};

		self.rules
			.write()
			.expect("rules lock")
			.insert((room_id, state_key), rule);

		Ok(())
	}

	#[must_use]
	pub fn rule_count(&self) -> usize {
		self.rules.read().expect("rules lock").len()
	}

	/// `None` means admitted.
	pub async fn is_user_banned(&self, user_id: &UserId) -> Result<Option<BanVerdict>> {
		{
			let rules = self.rules.read().expect("rules lock");
			for rule in rules.values() {
				let matched = match rule.kind {
					| RuleKind::User => rule.matcher.matches(user_id.as_str()),
					| RuleKind::Server =>
						rule.matcher.matches(user_id.server_name().as_str()),
				};

				if matched {
					return Ok(Some(BanVerdict::Rule { reason: rule.reason.clone() }));
				}
			}
		}

		let config = self.services.server.config.get();
		let Some(ban_sync) = &config.ban_sync else {
			return Ok(None);
		};
		if !ban_sync.block_open_registration {
			return Ok(None);
		}

		// our own users never probe their own homeserver
		if self.services.globals.is_our_user(user_id) {
			return Ok(None);
		}

		let host = user_id.server_name().as_str().to_owned();
		let classification = self.classify_host(&host).await?;

		let blocked = classification == Registration::Open
			|| (classification == Registration::Unknown && ban_sync.allow_unknown);

		Ok(blocked.then(|| BanVerdict::OpenRegistration { host }))
	}

	async fn classify_host(&self, host: &str) -> Result<Registration> {
		{
			let verdicts = self.verdicts.lock().expect("verdict lock");
			if let Some((classification, expires)) = verdicts.get(host) {
				if millis_since_unix_epoch() < *expires {
					return Ok(*classification);
				}
			}
		}

		let probe = self
			.services
			.client
			.probe_registration(host)
			.await?;
		let classification = classify(&probe);

		let ttl = VERDICT_TTL_MS.saturating_add_signed(jitter_signed_ms(VERDICT_JITTER_MS));
		self.verdicts
			.lock()
			.expect("verdict lock")
			.insert(host.to_owned(), (
				classification,
				millis_since_unix_epoch().saturating_add(ttl),
			));

		debug!(%host, ?classification, "registration probe classified");
		Ok(classification)
	}
}

#[cfg(test)]
mod tests {
	use ruma::{room_id, user_id};
	use serde_json::json;

	use super::BanVerdict;
	use crate::test_utils::test_services_with;

	fn policy_event(
		room: &str,
		kind: &str,
		state_key: &str,
		content: serde_json::Value,
	) -> mxbridge_core::BridgeEvent {
		serde_json::from_value(json!({
			"event_id": format!("$policy{state_key}:example.org"),
			"room_id": room,
			"sender": "@mod:example.org",
			"type": kind,
			"state_key": state_key,
			"content": content,
		}))
		.unwrap()
	}

	fn ban_sync_config(config: &mut mxbridge_core::Config) {
		config.ban_sync = Some(
			serde_json::from_value(json!({
				"rooms": ["!policy:example.org"],
				"block_open_registration": true,
			}))
			.unwrap(),
		);
	}

	#[tokio::test]
	async fn user_and_server_rules_match_globs() {
		let harness = test_services_with(ban_sync_config).await;
		let ban_sync = &harness.services.services.ban_sync;
		let room = room_id!("!policy:example.org");

		ban_sync
			.handle_event(&policy_event(
				room.as_str(),
				"m.policy.rule.user",
				"rule-1",
				json!({"entity": "@spam*:*", "recommendation": "m.ban", "reason": "spam"}),
			))
			.unwrap();
		ban_sync
			.handle_event(&policy_event(
				room.as_str(),
				"org.matrix.mjolnir.rule.server",
				"rule-2",
				json!({"entity": "*.badhost.example", "recommendation": "org.matrix.mjolnir.ban"}),
			))
			.unwrap();

		let verdict = ban_sync
			.is_user_banned(user_id!("@spammer:anywhere.org"))
			.await
			.unwrap();
		assert_eq!(verdict, Some(BanVerdict::Rule { reason: "spam".to_owned() }));

		let verdict = ban_sync
			.is_user_banned(user_id!("@innocent:evil.badhost.example"))
			.await
			.unwrap();
		assert!(matches!(verdict, Some(BanVerdict::Rule { .. })));
	}

	#[tokio::test]
	async fn absent_entity_deletes_exactly_one_rule() {
		let harness = test_services_with(ban_sync_config).await;
		let ban_sync = &harness.services.services.ban_sync;
		let room = room_id!("!policy:example.org");

		for (key, entity) in [("rule-a", "@a:*"), ("rule-b", "@b:*")] {
			ban_sync
				.handle_event(&policy_event(
					room.as_str(),
					"m.policy.rule.user",
					key,
					json!({"entity": entity, "recommendation": "m.ban"}),
				))
				.unwrap();
		}
		assert_eq!(ban_sync.rule_count(), 2);

		ban_sync
			.handle_event(&policy_event(room.as_str(), "m.policy.rule.user", "rule-a", json!({})))
			.unwrap();

		assert_eq!(ban_sync.rule_count(), 1);
		assert!(ban_sync
			.is_user_banned(user_id!("@a:ok.org"))
			.await
			.unwrap()
			.is_none());
	}

	#[tokio::test]
	async fn empty_entity_is_a_hard_error() {
		let harness = test_services_with(ban_sync_config).await;
		let ban_sync = &harness.services.services.ban_sync;

		let result = ban_sync.handle_event(&policy_event(
			"!policy:example.org",
			"m.policy.rule.user",
			"rule-bad",
			json!({"entity": "", "recommendation": "m.ban"}),
		));
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn open_registration_blocks_and_caches() {
		let harness = test_services_with(ban_sync_config).await;
		let ban_sync = &harness.services.services.ban_sync;

		harness.mock.set_probe(
			"open.example",
			401,
			json!({"flows": [{"stages": ["m.login.dummy"]}]}),
		);

		let verdict = ban_sync
			.is_user_banned(user_id!("@a:open.example"))
			.await
			.unwrap();
		assert_eq!(
			verdict,
			Some(BanVerdict::OpenRegistration { host: "open.example".to_owned() })
		);

		// the verdict is cached per host
		ban_sync
			.is_user_banned(user_id!("@b:open.example"))
			.await
			.unwrap();
		assert_eq!(harness.mock.call_count("probe"), 1);
	}

	#[tokio::test]
	async fn closed_registration_admits() {
		let harness = test_services_with(ban_sync_config).await;
		let ban_sync = &harness.services.services.ban_sync;

		harness
			.mock
			.set_probe("closed.example", 401, json!({"flows": []}));

		assert!(ban_sync
			.is_user_banned(user_id!("@a:closed.example"))
			.await
			.unwrap()
			.is_none());
	}
}
