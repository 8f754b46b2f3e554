//! Signed, TTL-bounded media URLs. A token is the base64url of the signed
//! JSON payload; the signature is HMAC-SHA-512 over the same payload with
//! the signature field absent. Verification recomputes and compares in
//! constant time, so a single flipped bit anywhere fails.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use mxbridge_core::{Result, err, utils::millis_since_unix_epoch};
use ruma::{EventId, OwnedEventId, OwnedMxcUri, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use url::Url;

use crate::services::OnceServices;

type HmacSha512 = Hmac<Sha512>;

/// The signed token payload. Field order matters: signing serializes this
/// struct without `signature`, so declaration order is the wire order.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct MediaToken {
	#[serde(rename = "endDt", default, skip_serializing_if = "Option::is_none")]
	pub end_dt: Option<u64>,

	#[serde(rename = "eventId")]
	pub event_id: OwnedEventId,

	#[serde(rename = "mediaId")]
	pub media_id: String,

	#[serde(rename = "roomId")]
	pub room_id: OwnedRoomId,
}

#[derive(Deserialize, Serialize)]
struct SignedToken {
	#[serde(flatten)]
	token: MediaToken,

	signature: String,
}

pub struct Service {
	signing_key: Option<Vec<u8>>,
	public_url: Option<Url>,
	ttl_ms: Option<u64>,
	services: Arc<OnceServices>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		let config = args.server.config.get();
		let media = config.media_proxy.as_ref();

		Ok(Arc::new(Self {
			signing_key: media.map(|m| m.signing_key.clone().into_bytes()),
			public_url: media.map(|m| m.public_url.clone()),
			ttl_ms: media.and_then(|m| m.ttl_ms),
			services: args.services.clone(),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	#[must_use]
	pub fn is_enabled(&self) -> bool { self.signing_key.is_some() }

	fn key(&self) -> Result<&[u8]> {
		self.signing_key
			.as_deref()
			.ok_or_else(|| err!("media proxy is not configured"))
	}

	fn sign(&self, token: &MediaToken) -> Result<String> {
		let unsigned = serde_json::to_vec(token)?;
		let mut mac =
			HmacSha512::new_from_slice(self.key()?).map_err(|e| err!("bad HMAC key: {e}"))?;
		mac.update(&unsigned);

		Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
	}

	/// Issue a signed, optionally expiring URL for a piece of room media.
	pub fn generate_media_url(
		&self,
		room_id: &RoomId,
		event_id: &EventId,
		media_id: &str,
	) -> Result<Url> {
		let public_url = self
			.public_url
			.as_ref()
			.ok_or_else(|| err!("media proxy is not configured"))?;

		let token = MediaToken {
			end_dt: self
				.ttl_ms
				.map(|ttl| millis_since_unix_epoch().saturating_add(ttl)),
			event_id: event_id.to_owned(),
			media_id: media_id.to_owned(),
			room_id: room_id.to_owned(),
		};

		let signature = self.sign(&token)?;
		let signed = serde_json::to_vec(&SignedToken { token, signature })?;
		let encoded = URL_SAFE_NO_PAD.encode(signed);

		let mut url = public_url.clone();
		url.path_segments_mut()
			.map_err(|()| err!("media public_url cannot be a base"))?
			.pop_if_empty()
			.extend(["v1", "media", "download", &encoded]);

		Ok(url)
	}

	/// Decode and verify a token; expiry and signature failures both reject.
	pub fn verify_token(&self, encoded: &str) -> Result<MediaToken> {
		let raw = URL_SAFE_NO_PAD
			.decode(encoded)
			.map_err(|e| err!(BadValue("malformed media token: {e}")))?;

		let signed: SignedToken = serde_json::from_slice(&raw)
			.map_err(|e| err!(BadValue("malformed media token: {e}")))?;

		let unsigned = serde_json::to_vec(&signed.token)?;
		let mut mac =
			HmacSha512::new_from_slice(self.key()?).map_err(|e| err!("bad HMAC key: {e}"))?;
		mac.update(&unsigned);

		let signature = URL_SAFE_NO_PAD
			.decode(&signed.signature)
			.map_err(|e| err!(BadValue("malformed media signature: {e}")))?;

		mac.verify_slice(&signature)
			.map_err(|_| err!(BadValue("media token signature mismatch")))?;

		if let Some(end_dt) = signed.token.end_dt {
			if end_dt < millis_since_unix_epoch() {
				return Err(err!(Request(NotFound("media token expired"))));
			}
		}

		Ok(signed.token)
	}

	/// Resolve a verified token to the mxc URL (and MSC3910 content token)
	/// of the event it was issued for.
	pub async fn resolve(&self, token: &MediaToken) -> Result<(OwnedMxcUri, Option<String>)> {
		let event = self
			.services
			.intent
			.bot()
			.get_event(&token.room_id, &token.event_id, true)
			.await?;

		let url = event
			.content
			.get("url")
			.and_then(serde_json::Value::as_str)
			.ok_or_else(|| err!(Request(NotFound("event has no media url"))))?;

		let content_token = event
			.content
			.get("content_token")
			.and_then(serde_json::Value::as_str)
			.map(ToOwned::to_owned);

		Ok((OwnedMxcUri::from(url), content_token))
	}

	/// Full download path: verify, resolve, stream from the homeserver.
	pub async fn download(&self, encoded: &str) -> Result<mxbridge_client::MediaDownload> {
		let token = self.verify_token(encoded)?;
		let (mxc, content_token) = self.resolve(&token).await?;

		self.services
			.client
			.download(&mxc, content_token.as_deref())
			.await
	}
}

#[cfg(test)]
mod tests {
	use ruma::{event_id, room_id};
	use serde_json::json;

	use crate::test_utils::test_services_with;

	fn with_media_proxy(config: &mut mxbridge_core::Config) {
		config.media_proxy = Some(
			serde_json::from_value(json!({
				"signing_key": "super-secret-signing-key",
				"public_url": "https://media.example.org",
				"ttl_ms": 60_000,
			}))
			.unwrap(),
		);
	}

	#[tokio::test]
	async fn token_roundtrip_is_identity() {
		let harness = test_services_with(with_media_proxy).await;
		let media = &harness.services.services.media_proxy;

		let url = media
			.generate_media_url(
				room_id!("!r:example.org"),
				event_id!("$e:example.org"),
				"media-1",
			)
			.unwrap();

		let encoded = url.path_segments().unwrap().next_back().unwrap().to_owned();
		let token = media.verify_token(&encoded).unwrap();

		assert_eq!(token.room_id.as_str(), "!r:example.org");
		assert_eq!(token.event_id.as_str(), "$e:example.org");
		assert_eq!(token.media_id, "media-1");
		assert!(token.end_dt.unwrap() > mxbridge_core::utils::millis_since_unix_epoch());
	}

	#[tokio::test]
	async fn any_bit_flip_fails_verification() {
		let harness = test_services_with(with_media_proxy).await;
		let media = &harness.services.services.media_proxy;

		let url = media
			.generate_media_url(
				room_id!("!r:example.org"),
				event_id!("$e:example.org"),
				"media-1",
			)
			.unwrap();
		let encoded = url.path_segments().unwrap().next_back().unwrap().to_owned();

		// flip one character somewhere in the middle of the token
		let mut bytes = encoded.into_bytes();
		let mid = bytes.len() / 2;
		bytes[mid] = if bytes[mid] == b'A' { b'B' } else { b'A' };
		let tampered = String::from_utf8(bytes).unwrap();

		assert!(media.verify_token(&tampered).is_err());
	}

	#[tokio::test]
	async fn expired_tokens_reject() {
		let harness = test_services_with(|config| {
			config.media_proxy = Some(
				serde_json::from_value(json!({
					"signing_key": "super-secret-signing-key",
					"public_url": "https://media.example.org",
					"ttl_ms": 0,
				}))
				.unwrap(),
			);
		})
		.await;
		let media = &harness.services.services.media_proxy;

		let url = media
			.generate_media_url(
				room_id!("!r:example.org"),
				event_id!("$e:example.org"),
				"media-1",
			)
			.unwrap();
		let encoded = url.path_segments().unwrap().next_back().unwrap().to_owned();

		tokio::time::sleep(std::time::Duration::from_millis(5)).await;

		let err = media.verify_token(&encoded).unwrap_err();
		assert!(err.is_not_found());
	}

	#[tokio::test]
	async fn download_streams_the_resolved_event_media() {
		use futures::StreamExt;

		let harness = test_services_with(with_media_proxy).await;
		let media = &harness.services.services.media_proxy;
		let room = room_id!("!r:example.org");
		let event = event_id!("$media:example.org");

		harness.mock.put_event(
			serde_json::from_value(json!({
				"event_id": event.as_str(),
				"room_id": room.as_str(),
				"sender": "@u:example.org",
				"type": "m.room.message",
				"content": {
					"msgtype": "m.image",
					"url": "mxc://example.org/cat",
				},
			}))
			.unwrap(),
		);
		harness
			.mock
			.put_media("mxc://example.org/cat", Some("image/png"), bytes::Bytes::from_static(b"meow"));

		let url = media.generate_media_url(room, event, "cat").unwrap();
		let encoded = url.path_segments().unwrap().next_back().unwrap().to_owned();

		let mut download = media.download(&encoded).await.unwrap();
		assert_eq!(download.content_type.as_deref(), Some("image/png"));

		let chunk = download.stream.next().await.unwrap().unwrap();
		assert_eq!(&chunk[..], b"meow");
	}
}
