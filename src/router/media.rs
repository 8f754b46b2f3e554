use std::sync::Arc;

use axum::{
	body::Body,
	extract::{Path, State},
	response::Response,
};
use mxbridge_service::Services;

use crate::response::RouterError;

/// `GET /v1/media/download/{token}`
///
/// Verifies the signed token, resolves the event's media, and streams the
/// homeserver response through with its representation headers intact.
pub(super) async fn download(
	State(services): State<Arc<Services>>,
	Path(token): Path<String>,
) -> Result<Response, RouterError> {
	let download = services
		.services
		.media_proxy
		.download(&token)
		.await?;

	let mut response = Response::builder().status(http::StatusCode::OK);

	if let Some(content_type) = &download.content_type {
		response = response.header(http::header::CONTENT_TYPE, content_type);
	}
	if let Some(content_length) = download.content_length {
		response = response.header(http::header::CONTENT_LENGTH, content_length);
	}
	if let Some(content_disposition) = &download.content_disposition {
		response = response.header(http::header::CONTENT_DISPOSITION, content_disposition);
	}

	response
		.body(Body::from_stream(download.stream))
		.map_err(|e| RouterError(e.into()))
}
