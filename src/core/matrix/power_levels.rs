use std::collections::BTreeMap;

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// `m.room.power_levels` content with the defaults the Matrix spec assigns to
/// absent fields. Unknown fields are carried through `rest` so a modified
/// power-levels event can be written back without dropping anything.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PowerLevelsContent {
	#[serde(default = "default_fifty")]
	pub state_default: i64,

	#[serde(default)]
	pub events_default: i64,

	#[serde(default)]
	pub users_default: i64,

	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub users: BTreeMap<OwnedUserId, i64>,

	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub events: BTreeMap<String, i64>,

	#[serde(flatten)]
	pub rest: serde_json::Map<String, JsonValue>,
}

impl Default for PowerLevelsContent {
	fn default() -> Self {
		Self {
			state_default: 50,
			events_default: 0,
			users_default: 0,
			users: BTreeMap::new(),
			events: BTreeMap::new(),
			rest: serde_json::Map::new(),
		}
	}
}

fn default_fifty() -> i64 { 50 }

impl PowerLevelsContent {
	/// Power the given user holds in this room.
	#[must_use]
	pub fn user_power(&self, user_id: &UserId) -> i64 {
		self.users
			.get(user_id)
			.copied()
			.unwrap_or(self.users_default)
	}

	/// Power required to send an event of `event_type`; `is_state` selects
	/// the applicable default when no per-type override exists.
	#[must_use]
	pub fn required_for(&self, event_type: &str, is_state: bool) -> i64 {
		self.events.get(event_type).copied().unwrap_or(if is_state {
			self.state_default
		} else {
			self.events_default
		})
	}

	/// Power required to modify the power levels themselves.
	#[must_use]
	pub fn required_to_modify(&self) -> i64 {
		self.events
			.get("m.room.power_levels")
			.copied()
			.unwrap_or(self.state_default)
	}

	/// Sets or clears a user's explicit power entry. Returns false when the
	/// entry already had the requested value (callers skip the send then).
	pub fn set_user_power(&mut self, user_id: &UserId, level: Option<i64>) -> bool {
		match level {
			| Some(level) => self.users.insert(user_id.to_owned(), level) != Some(level),
			| None => self.users.remove(user_id).is_some(),
		}
	}
}

#[cfg(test)]
mod tests {
	use ruma::user_id;
	use serde_json::json;

	use super::PowerLevelsContent;

	#[test]
	fn spec_defaults_apply_to_absent_fields() {
		let pl: PowerLevelsContent = serde_json::from_value(json!({})).unwrap();
		assert_eq!(pl.state_default, 50);
		assert_eq!(pl.events_default, 0);
		assert_eq!(pl.user_power(user_id!("@nobody:example.org")), 0);
	}

	#[test]
	fn event_override_beats_defaults() {
		let pl: PowerLevelsContent = serde_json::from_value(json!({
			"events_default": 25,
			"events": {"m.room.message": 75},
		}))
		.unwrap();
		assert_eq!(pl.required_for("m.room.message", false), 75);
		assert_eq!(pl.required_for("m.room.other", false), 25);
		assert_eq!(pl.required_for("m.room.name", true), 50);
	}

	#[test]
	fn unknown_fields_survive_roundtrip() {
		let raw = json!({
			"users_default": 10,
			"ban": 60,
			"notifications": {"room": 20},
		});
		let pl: PowerLevelsContent = serde_json::from_value(raw).unwrap();
		let back = serde_json::to_value(&pl).unwrap();
		assert_eq!(back["ban"], 60);
		assert_eq!(back["notifications"]["room"], 20);
	}

	#[test]
	fn set_user_power_reports_changes() {
		let mut pl = PowerLevelsContent::default();
		let user = user_id!("@ghost:example.org");
		assert!(pl.set_user_power(user, Some(50)));
		assert!(!pl.set_user_power(user, Some(50)));
		assert!(pl.set_user_power(user, None));
		assert!(!pl.set_user_power(user, None));
	}
}
