//! Idempotent machine-readable service notices. Notices are state events
//! keyed by notice id, squashed to at most one update per period, and
//! resolved in place rather than deleted.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use mxbridge_core::{
	Result, debug,
	utils::{millis_since_unix_epoch, time::format_millis},
};
use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::services::OnceServices;

pub const NOTICE_STATE_TYPE: &str = "org.matrix.service-notice";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Info,
	Warning,
	Error,
}

pub struct Service {
	room: Option<OwnedRoomId>,
	prefix: String,
	minimum_update_period_ms: u64,
	last_notice: Mutex<HashMap<String, u64>>,
	services: Arc<OnceServices>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		let config = args.server.config.get();
		let service_room = config.service_room.as_ref();

		Ok(Arc::new(Self {
			room: service_room.map(|c| c.room.clone()),
			prefix: service_room.map_or_else(|| "service".to_owned(), |c| c.prefix.clone()),
			minimum_update_period_ms: service_room
				.map_or(60 * 60 * 1000, |c| c.minimum_update_period_ms),
			last_notice: Mutex::new(HashMap::new()),
			services: args.services.clone(),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	fn state_key(&self, notice_id: &str) -> String {
		format!("{}_{notice_id}", self.prefix)
	}

	/// Post or update a notice. Repeated sends for the same notice id inside
	/// the update period are squashed to nothing.
	pub async fn send_service_notice(
		&self,
		message: &str,
		severity: Severity,
		notice_id: &str,
		code: Option<&str>,
	) -> Result {
		let Some(room) = &self.room else {
			return Ok(());
		};

		{
			let last = self.last_notice.lock().expect("notice lock");
			if let Some(previous) = last.get(notice_id) {
				if millis_since_unix_epoch().saturating_sub(*previous)
					< self.minimum_update_period_ms
				{
					debug!(notice_id, "service notice squashed inside update period");
					return Ok(());
				}
			}
		}

		let now = millis_since_unix_epoch();
		let content = json!({
			"message": message,
			"severity": severity,
			"notice_id": notice_id,
			"metadata": { "timestamp": format_millis(now) },
			"code": code,
			"org.matrix.msc1767.text": message,
		});

		self.services
			.intent
			.bot()
			.send_state_event(room, NOTICE_STATE_TYPE, &self.state_key(notice_id), content)
			.await?;

		self.last_notice
			.lock()
			.expect("notice lock")
			.insert(notice_id.to_owned(), now);

		Ok(())
	}

	/// Mark a notice resolved unless it already is. Clears the squash clock
	/// so a recurrence posts immediately.
	pub async fn clear_service_notice(&self, notice_id: &str) -> Result {
		let Some(room) = &self.room else {
			return Ok(());
		};

		let state_key = self.state_key(notice_id);
		let current = self
			.get_service_notification(notice_id)
			.await
			.unwrap_or(JsonValue::Null);

		if current.get("resolved").and_then(JsonValue::as_bool) != Some(true) {
			let content = json!({
				"resolved": true,
				"metadata": { "timestamp": format_millis(millis_since_unix_epoch()) },
			});

			self.services
				.intent
				.bot()
				.send_state_event(room, NOTICE_STATE_TYPE, &state_key, content)
				.await?;
		}

		self.last_notice
			.lock()
			.expect("notice lock")
			.remove(notice_id);

		Ok(())
	}

	pub async fn get_service_notification(&self, notice_id: &str) -> Result<JsonValue> {
		let Some(room) = &self.room else {
			return Ok(JsonValue::Null);
		};

		self.services
			.intent
			.bot()
			.get_state_event(room, NOTICE_STATE_TYPE, &self.state_key(notice_id), false)
			.await
	}

	#[must_use]
	pub fn has_pending_notice(&self, notice_id: &str) -> bool {
		self.last_notice
			.lock()
			.expect("notice lock")
			.contains_key(notice_id)
	}
}

#[cfg(test)]
mod tests {
	use ruma::room_id;
	use serde_json::json;

	use super::Severity;
	use crate::test_utils::test_services_with;

	fn with_service_room(config: &mut mxbridge_core::Config) {
		config.service_room = Some(
			serde_json::from_value(json!({
				"room": "!service:example.org",
				"prefix": "mybridge",
			}))
			.unwrap(),
		);
	}

	#[tokio::test]
	async fn notices_are_state_keyed_and_squashed() {
		let harness = test_services_with(with_service_room).await;
		let service_room = &harness.services.services.service_room;
		let room = room_id!("!service:example.org");

		service_room
			.send_service_notice("DB degraded", Severity::Warning, "db-degraded", Some("DB01"))
			.await
			.unwrap();
		service_room
			.send_service_notice("DB degraded", Severity::Warning, "db-degraded", Some("DB01"))
			.await
			.unwrap();

		let content = harness
			.mock
			.sent_state(room, "org.matrix.service-notice", "mybridge_db-degraded")
			.unwrap();
		assert_eq!(content["severity"], "warning");
		assert_eq!(content["notice_id"], "db-degraded");
		assert_eq!(content["code"], "DB01");
		assert_eq!(content["org.matrix.msc1767.text"], "DB degraded");

		// squashed: only one state event went out
		let sends = harness
			.mock
			.sent()
			.iter()
			.filter(|s| s.event_type == "org.matrix.service-notice")
			.count();
		assert_eq!(sends, 1);
	}

	#[tokio::test]
	async fn clear_resolves_and_forgets_the_squash_clock() {
		let harness = test_services_with(with_service_room).await;
		let service_room = &harness.services.services.service_room;
		let room = room_id!("!service:example.org");

		service_room
			.send_service_notice("offline", Severity::Error, "net-down", None)
			.await
			.unwrap();
		assert!(service_room.has_pending_notice("net-down"));

		service_room.clear_service_notice("net-down").await.unwrap();
		assert!(!service_room.has_pending_notice("net-down"));

		let resolved = service_room
			.get_service_notification("net-down")
			.await
			.unwrap();
		assert_eq!(resolved["resolved"], true);

		let content = harness
			.mock
			.sent_state(room, "org.matrix.service-notice", "mybridge_net-down")
			.unwrap();
		assert_eq!(content["resolved"], true);
	}

	#[tokio::test]
	async fn clear_is_idempotent_on_already_resolved() {
		let harness = test_services_with(with_service_room).await;
		let service_room = &harness.services.services.service_room;

		service_room
			.send_service_notice("x", Severity::Info, "once", None)
			.await
			.unwrap();
		service_room.clear_service_notice("once").await.unwrap();

		let sends_before = harness.mock.sent().len();
		service_room.clear_service_notice("once").await.unwrap();
		assert_eq!(harness.mock.sent().len(), sends_before);
	}
}
