//! Homeserver authentication for the appservice endpoints: the `hs_token`
//! from the registration, as a bearer token or (legacy) `access_token`
//! query parameter.

use std::sync::Arc;

use axum::{
	extract::{Request, State},
	middleware::Next,
	response::Response,
};
use mxbridge_core::err;
use mxbridge_service::Services;

use crate::response::RouterError;

pub(super) async fn require_hs_token(
	State(services): State<Arc<Services>>,
	request: Request,
	next: Next,
) -> Result<Response, RouterError> {
	let expected = services.server.registration.hs_token.as_str();

	let bearer = request
		.headers()
		.get(http::header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "));

	let query_token = request.uri().query().and_then(|query| {
		url::form_urlencoded::parse(query.as_bytes())
			.find(|(key, _)| key == "access_token")
			.map(|(_, value)| value.into_owned())
	});

	let presented = bearer.map(ToOwned::to_owned).or(query_token);
	match presented {
		| Some(token) if token == expected => Ok(next.run(request).await),
		| Some(_) => Err(err!(Request(Forbidden("Incorrect homeserver token"))).into()),
		| None => Err(RouterError(mxbridge_core::Error::Matrix {
			errcode: "M_UNAUTHORIZED".to_owned(),
			message: "Missing homeserver token".to_owned(),
			status: http::StatusCode::UNAUTHORIZED,
		})),
	}
}
