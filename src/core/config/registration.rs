//! The application-service registration artifact, bit-compatible with the
//! Matrix AS spec YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, err, utils};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Registration {
	pub id: String,

	/// URL the homeserver pushes transactions to; `null` disables push.
	pub url: Option<String>,

	pub as_token: String,
	pub hs_token: String,
	pub sender_localpart: String,

	#[serde(default)]
	pub namespaces: Namespaces,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub protocols: Option<Vec<String>>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rate_limited: Option<bool>,

	#[serde(
		rename = "de.sorunome.msc2409.push_ephemeral",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub push_ephemeral: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Namespaces {
	#[serde(default)]
	pub users: Vec<Namespace>,

	#[serde(default)]
	pub aliases: Vec<Namespace>,

	#[serde(default)]
	pub rooms: Vec<Namespace>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Namespace {
	pub exclusive: bool,
	pub regex: String,
}

impl Registration {
	pub fn load(path: &Path) -> Result<Self> {
		let file = std::fs::File::open(path)
			.map_err(|e| err!("Failed to open registration file {path:?}: {e}"))?;

		serde_yaml::from_reader(file).map_err(Into::into)
	}

	pub fn save(&self, path: &Path) -> Result {
		let file = std::fs::File::create(path)
			.map_err(|e| err!("Failed to create registration file {path:?}: {e}"))?;

		serde_yaml::to_writer(file, self).map_err(Into::into)
	}

	/// Produce a fresh registration with random tokens and a single exclusive
	/// user namespace derived from the sender localpart.
	#[must_use]
	pub fn generate(
		id: &str,
		url: &str,
		sender_localpart: &str,
		server_name: &ruma::ServerName,
	) -> Self {
		Self {
			id: id.to_owned(),
			url: Some(url.to_owned()),
			as_token: utils::random_string(64),
			hs_token: utils::random_string(64),
			sender_localpart: sender_localpart.to_owned(),
			namespaces: Namespaces {
				users: vec![Namespace {
					exclusive: true,
					regex: format!(
						"@{}_.*:{}",
						regex::escape(sender_localpart),
						regex::escape(server_name.as_str())
					),
				}],
				aliases: Vec::new(),
				rooms: Vec::new(),
			},
			protocols: None,
			rate_limited: Some(false),
			push_ephemeral: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::Registration;

	#[test]
	fn yaml_roundtrip_is_spec_shaped() {
		let reg = Registration::generate(
			"gitter",
			"http://localhost:8090",
			"gitterbot",
			ruma::server_name!("example.org"),
		);

		let yaml = serde_yaml::to_string(&reg).unwrap();
		assert!(yaml.contains("as_token:"));
		assert!(yaml.contains("hs_token:"));
		assert!(yaml.contains("sender_localpart: gitterbot"));
		assert!(yaml.contains("exclusive: true"));

		let back: Registration = serde_yaml::from_str(&yaml).unwrap();
		assert_eq!(back.as_token, reg.as_token);
		assert_eq!(back.namespaces.users.len(), 1);
		assert_ne!(back.as_token, back.hs_token);
	}

	#[test]
	fn tolerates_minimal_upstream_files() {
		let reg: Registration = serde_yaml::from_str(
			"id: slack\nurl: null\nas_token: a\nhs_token: h\nsender_localpart: slackbot\n",
		)
		.unwrap();
		assert!(reg.url.is_none());
		assert!(reg.namespaces.users.is_empty());
	}
}
