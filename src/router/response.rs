use axum::{
	Json,
	response::{IntoResponse, Response},
};
use mxbridge_core::Error;
use serde_json::json;

/// Bridges the core error taxonomy onto Matrix-shaped HTTP error bodies.
pub struct RouterError(pub Error);

impl From<Error> for RouterError {
	fn from(error: Error) -> Self { Self(error) }
}

impl IntoResponse for RouterError {
	fn into_response(self) -> Response {
		let status = self.0.status_code();
		let body = Json(json!({
			"errcode": self.0.errcode(),
			"error": self.0.sanitized_message(),
		}));

		(status, body).into_response()
	}
}
