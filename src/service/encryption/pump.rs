//! The per-owner decrypting sync pump. One pump runs per owning user,
//! long-polling `/sync` with a filter reduced to encrypted timeline events
//! (state disabled via an impossible marker, members lazy-loaded) and
//! presence when the bridge wants ephemeral traffic.

use std::{sync::Arc, time::Duration};

use mxbridge_core::{debug, warn};
use serde_json::{Value as JsonValue, json};

use crate::services::OnceServices;

const SYNC_TIMEOUT_MS: u64 = 30 * 1000;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub(super) async fn run(
	services: Arc<OnceServices>,
	user_id: ruma::OwnedUserId,
	wake: loole::Receiver<()>,
) {
	let wants_ephemeral = services.controller.wants_ephemeral();
	let filter = sync_filter(wants_ephemeral);
	let mut since: Option<String> = None;

	debug!(user = %user_id, "encrypted sync pump started");

	while services.server.running() {
		let response = services
			.client
			.sync(&user_id, &filter, since.as_deref(), SYNC_TIMEOUT_MS)
			.await;

		let response = match response {
			| Ok(response) => response,
			| Err(e) => {
				warn!(user = %user_id, "encrypted sync failed: {e}");
				// a wake from the AS path cuts the backoff short
				tokio::select! {
					_ = wake.recv_async() => {},
					() = tokio::time::sleep(ERROR_BACKOFF) => {},
				}
				continue;
			},
		};

		since = Some(response.next_batch);

		for (room_id, joined) in response.rooms.join {
			for mut event in joined.timeline.events {
				event.room_id.get_or_insert_with(|| room_id.clone());

				if let Some(deliverable) = services.encryption.on_sync_event(event) {
					if let Err(e) = services.appservice.dispatch(deliverable).await {
						warn!(room = %room_id, "decrypted event dispatch failed: {e}");
					}
				}
			}
		}

		if wants_ephemeral {
			for event in response.presence.events {
				if services.encryption.should_deliver_presence(&event) {
					services.appservice.dispatch_ephemeral(&event).await;
				}
			}
		}
	}

	debug!(user = %user_id, "encrypted sync pump stopped");
}

fn sync_filter(wants_ephemeral: bool) -> JsonValue {
	let presence_types: Vec<&str> = if wants_ephemeral { vec!["m.presence"] } else { Vec::new() };

	json!({
		"room": {
			"timeline": {
				"types": ["m.room.encrypted"],
				"limit": 20,
			},
			// an impossible marker type: all state disabled
			"state": {
				"types": ["org.matrix.mxbridge.none"],
				"lazy_load_members": true,
			},
			"ephemeral": { "types": [] },
			"account_data": { "types": [] },
		},
		"presence": { "types": presence_types },
		"account_data": { "types": [] },
	})
}

#[cfg(test)]
mod tests {
	use super::sync_filter;

	#[test]
	fn filter_restricts_to_encrypted_timeline() {
		let filter = sync_filter(false);
		assert_eq!(filter["room"]["timeline"]["types"][0], "m.room.encrypted");
		assert_eq!(filter["room"]["state"]["types"][0], "org.matrix.mxbridge.none");
		assert_eq!(filter["room"]["state"]["lazy_load_members"], true);
		assert!(filter["presence"]["types"].as_array().unwrap().is_empty());

		let filter = sync_filter(true);
		assert_eq!(filter["presence"]["types"][0], "m.presence");
	}
}
