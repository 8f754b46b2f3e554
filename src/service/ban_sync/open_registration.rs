//! Classification of a homeserver's `POST /register` probe response.

use mxbridge_client::RegisterProbe;
use serde_json::Value as JsonValue;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Registration {
	Closed,
	Unknown,
	Open,
	ProtectedEmail,
	ProtectedCaptcha,
}

const STAGE_RECAPTCHA: &str = "m.login.recaptcha";
const STAGE_EMAIL: &str = "m.login.email.identity";

#[must_use]
pub fn classify(probe: &RegisterProbe) -> Registration {
	match probe.status {
		| 403 if probe.body.get("errcode").and_then(JsonValue::as_str)
			== Some("M_FORBIDDEN") =>
			Registration::Closed,
		| 404 => Registration::Closed,
		| 401 => classify_flows(&probe.body),
		| _ => Registration::Unknown,
	}
}

fn classify_flows(body: &JsonValue) -> Registration {
	let Some(flows) = body.get("flows").and_then(JsonValue::as_array) else {
		return Registration::Unknown;
	};

	if flows.is_empty() {
		return Registration::Closed;
	}

	let mut any_email_unprotected = false;
	for flow in flows {
		let stages: Vec<&str> = flow
			.get("stages")
			.and_then(JsonValue::as_array)
			.map(|stages| {
				stages
					.iter()
					.filter_map(JsonValue::as_str)
					.collect()
			})
			.unwrap_or_default();

		let has_captcha = stages.contains(&STAGE_RECAPTCHA);
		let has_email = stages.contains(&STAGE_EMAIL);

		// one fully unguarded flow is enough to walk in
		if !has_captcha && !has_email {
			return Registration::Open;
		}

		if has_email && !has_captcha {
			any_email_unprotected = true;
		}
	}

	if any_email_unprotected {
		Registration::ProtectedEmail
	} else {
		Registration::ProtectedCaptcha
	}
}
