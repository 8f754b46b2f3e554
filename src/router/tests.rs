#![cfg(test)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, StatusCode};
use mxbridge_client::MockHomeserver;
use mxbridge_core::{
	BridgeEvent, Result, Server,
	config::registration::{Namespace, Namespaces, Registration},
};
use mxbridge_service::{BridgeController, Services, store::Stores};
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;

struct NullController;

#[async_trait]
impl BridgeController for NullController {
	async fn on_event(&self, _: &BridgeEvent) -> Result { Ok(()) }
}

fn registration() -> Registration {
	Registration {
		id: "mxbridge-test".to_owned(),
		url: Some("http://localhost:8090".to_owned()),
		as_token: "as-token".to_owned(),
		hs_token: "hs-token".to_owned(),
		sender_localpart: "bridgebot".to_owned(),
		namespaces: Namespaces {
			users: vec![Namespace {
				exclusive: true,
				regex: r"@remote_.*:example\.org".to_owned(),
			}],
			aliases: Vec::new(),
			rooms: Vec::new(),
		},
		protocols: None,
		rate_limited: None,
		push_ephemeral: None,
	}
}

fn harness() -> (axum::Router, Arc<MockHomeserver>) {
	let config = serde_json::from_value(json!({
		"homeserver_url": "http://localhost:8008",
		"server_name": "example.org",
		"media_proxy": {
			"signing_key": "router-test-key",
			"public_url": "https://media.example.org",
		},
	}))
	.unwrap();

	let server = Arc::new(Server::new(
		config,
		registration(),
		Some(tokio::runtime::Handle::current()),
	));

	let mock = Arc::new(MockHomeserver::new());
	let services =
		Services::build(server, mock.clone(), Arc::new(NullController), Stores::default())
			.unwrap();

	(super::build(services), mock)
}

async fn body_json(response: axum::response::Response) -> JsonValue {
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
		.await
		.unwrap();
	serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null)
}

#[tokio::test]
async fn health_needs_no_auth() {
	let (router, _mock) = harness();

	let response = router
		.oneshot(Request::get("/health").body(Body::empty()).unwrap())
		.await
		.unwrap();

	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(body_json(response).await, json!({"ok": true}));
}

#[tokio::test]
async fn transactions_require_the_hs_token() {
	let (router, _mock) = harness();

	let unauthed = Request::put("/_matrix/app/v1/transactions/t1")
		.header("content-type", "application/json")
		.body(Body::from(r#"{"events": []}"#))
		.unwrap();

	let response = router.clone().oneshot(unauthed).await.unwrap();
	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

	let wrong = Request::put("/_matrix/app/v1/transactions/t1")
		.header("authorization", "Bearer wrong-token")
		.header("content-type", "application/json")
		.body(Body::from(r#"{"events": []}"#))
		.unwrap();

	let response = router.clone().oneshot(wrong).await.unwrap();
	assert_eq!(response.status(), StatusCode::FORBIDDEN);
	assert_eq!(body_json(response).await["errcode"], "M_FORBIDDEN");

	let authed = Request::put("/_matrix/app/v1/transactions/t1")
		.header("authorization", "Bearer hs-token")
		.header("content-type", "application/json")
		.body(Body::from(r#"{"events": []}"#))
		.unwrap();

	let response = router.oneshot(authed).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn legacy_query_token_is_accepted() {
	let (router, _mock) = harness();

	let request = Request::put("/transactions/t2?access_token=hs-token")
		.header("content-type", "application/json")
		.body(Body::from(r#"{"events": []}"#))
		.unwrap();

	let response = router.oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_events_do_not_fail_the_batch() {
	let (router, _mock) = harness();

	let body = json!({
		"events": [
			{"not": "an event"},
			{
				"event_id": "$ok:example.org",
				"room_id": "!r:example.org",
				"sender": "@remote_ghost:example.org",
				"type": "m.room.message",
				"content": {"msgtype": "m.text", "body": "hi"},
			},
		],
	});

	let request = Request::put("/_matrix/app/v1/transactions/t3")
		.header("authorization", "Bearer hs-token")
		.header("content-type", "application/json")
		.body(Body::from(body.to_string()))
		.unwrap();

	let response = router.oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_users_are_404() {
	let (router, _mock) = harness();

	let request = Request::get("/_matrix/app/v1/users/@remote_who:example.org")
		.header("authorization", "Bearer hs-token")
		.body(Body::empty())
		.unwrap();

	let response = router.oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
	assert_eq!(body_json(response).await["errcode"], "M_NOT_FOUND");
}

#[tokio::test]
async fn malformed_media_tokens_are_rejected() {
	let (router, _mock) = harness();

	let request = Request::get("/v1/media/download/not-a-real-token")
		.body(Body::empty())
		.unwrap();

	let response = router.oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	assert_eq!(body_json(response).await["errcode"], "M_BAD_JSON");
}

#[tokio::test]
async fn media_download_streams_with_headers() {
	let (router, mock) = harness();

	mock.put_event(
		serde_json::from_value(json!({
			"event_id": "$img:example.org",
			"room_id": "!m:example.org",
			"sender": "@u:example.org",
			"type": "m.room.message",
			"content": {"msgtype": "m.image", "url": "mxc://example.org/pic"},
		}))
		.unwrap(),
	);
	mock.put_media(
		"mxc://example.org/pic",
		Some("image/jpeg"),
		bytes::Bytes::from_static(b"jpegdata"),
	);

	// mint a real token against the same signing key via a sibling harness
	let services_token = {
		let config = serde_json::from_value(json!({
			"homeserver_url": "http://localhost:8008",
			"server_name": "example.org",
			"media_proxy": {
				"signing_key": "router-test-key",
				"public_url": "https://media.example.org",
			},
		}))
		.unwrap();
		let server = Arc::new(Server::new(
			config,
			registration(),
			Some(tokio::runtime::Handle::current()),
		));
		let services = Services::build(
			server,
			mock.clone(),
			Arc::new(NullController),
			Stores::default(),
		)
		.unwrap();

		let url = services
			.services
			.media_proxy
			.generate_media_url(
				ruma::room_id!("!m:example.org"),
				ruma::event_id!("$img:example.org"),
				"pic",
			)
			.unwrap();

		url.path_segments().unwrap().next_back().unwrap().to_owned()
	};

	let request = Request::get(format!("/v1/media/download/{services_token}"))
		.body(Body::empty())
		.unwrap();

	let response = router.oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(
		response
			.headers()
			.get("content-type")
			.unwrap()
			.to_str()
			.unwrap(),
		"image/jpeg"
	);

	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
		.await
		.unwrap();
	assert_eq!(&bytes[..], b"jpegdata");
}
