//! The bridge's HTTP surface: the application-service endpoints the
//! homeserver pushes to, the signed media-download endpoint, and a health
//! probe. Everything mounts on one axum router.

mod appservice;
mod auth;
mod media;
mod response;
mod serve;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::{
	Router, middleware,
	routing::{get, post, put},
};
use mxbridge_service::Services;
use tower_http::trace::TraceLayer;

pub use self::serve::serve;
pub use response::RouterError;

#[must_use]
pub fn build(services: Arc<Services>) -> Router {
	let appservice = Router::new()
		.route("/_matrix/app/v1/transactions/{txn_id}", put(appservice::put_transaction))
		.route("/_matrix/app/v1/users/{user_id}", get(appservice::get_user))
		.route("/_matrix/app/v1/rooms/{room_alias}", get(appservice::get_room))
		.route("/_matrix/app/v1/ping", post(appservice::post_ping))
		// legacy paths from before the route namespacing
		.route("/transactions/{txn_id}", put(appservice::put_transaction))
		.route("/users/{user_id}", get(appservice::get_user))
		.route("/rooms/{room_alias}", get(appservice::get_room))
		.layer(middleware::from_fn_with_state(services.clone(), auth::require_hs_token));

	Router::new()
		.merge(appservice)
		.route("/v1/media/download/{token}", get(media::download))
		.route("/health", get(health))
		.layer(TraceLayer::new_for_http())
		.with_state(services)
}

async fn health() -> axum::Json<serde_json::Value> {
	axum::Json(serde_json::json!({"ok": true}))
}
