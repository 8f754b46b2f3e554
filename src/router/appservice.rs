use std::sync::Arc;

use axum::{
	Json,
	extract::{Path, State},
};
use mxbridge_core::{BridgeEvent, debug_warn, err};
use mxbridge_service::Services;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::response::RouterError;

#[derive(Deserialize)]
pub(super) struct TransactionBody {
	#[serde(default)]
	events: Vec<JsonValue>,

	#[serde(
		default,
		alias = "de.sorunome.msc2409.ephemeral",
		alias = "org.matrix.msc2409.ephemeral"
	)]
	ephemeral: Vec<JsonValue>,
}

/// `PUT /_matrix/app/v1/transactions/{txnId}`
///
/// Malformed events inside a transaction are skipped rather than failing
/// the batch; a non-200 would make the homeserver replay it forever.
pub(super) async fn put_transaction(
	State(services): State<Arc<Services>>,
	Path(txn_id): Path<String>,
	Json(body): Json<TransactionBody>,
) -> Result<Json<JsonValue>, RouterError> {
	let parse = |raw: Vec<JsonValue>| {
		raw.into_iter()
			.filter_map(|raw| match serde_json::from_value::<BridgeEvent>(raw) {
				| Ok(event) => Some(event),
				| Err(e) => {
					debug_warn!(txn_id, "skipping malformed transaction event: {e}");
					None
				},
			})
			.collect::<Vec<_>>()
	};

	let events = parse(body.events);
	let ephemeral = parse(body.ephemeral);

	services
		.services
		.appservice
		.handle_transaction(&txn_id, events, ephemeral)
		.await?;

	Ok(Json(json!({})))
}

/// `GET /_matrix/app/v1/users/{userId}`
pub(super) async fn get_user(
	State(services): State<Arc<Services>>,
	Path(user_id): Path<String>,
) -> Result<Json<JsonValue>, RouterError> {
	let user_id = ruma::UserId::parse(&user_id)
		.map_err(|e| err!(BadValue("invalid user id: {e}")))?;

	if services
		.services
		.appservice
		.user_query(&user_id)
		.await?
	{
		Ok(Json(json!({})))
	} else {
		Err(err!(Request(NotFound("User not provisioned by this bridge"))).into())
	}
}

/// `GET /_matrix/app/v1/rooms/{roomAlias}`
pub(super) async fn get_room(
	State(services): State<Arc<Services>>,
	Path(room_alias): Path<String>,
) -> Result<Json<JsonValue>, RouterError> {
	let alias = ruma::RoomAliasId::parse(&room_alias)
		.map_err(|e| err!(BadValue("invalid room alias: {e}")))?;

	match services
		.services
		.appservice
		.alias_query(&alias)
		.await?
	{
		| Some(_) => Ok(Json(json!({}))),
		| None => Err(err!(Request(NotFound("Alias not provisioned by this bridge"))).into()),
	}
}

/// `POST /_matrix/app/v1/ping` (MSC2659)
pub(super) async fn post_ping() -> Json<JsonValue> { Json(json!({})) }
