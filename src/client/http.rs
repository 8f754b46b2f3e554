use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use mxbridge_core::{BridgeEvent, Error, Profile, Result, Server, err};
use reqwest::Method;
use ruma::{
	EventId, MxcUri, OwnedEventId, OwnedMxcUri, OwnedRoomId, OwnedServerName, OwnedUserId,
	RoomAliasId, RoomId, RoomOrAliasId, TransactionId, UserId,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use url::Url;

use crate::{
	Homeserver,
	response::{MediaDownload, PresenceStatus, RegisterProbe, SyncResponse, WhoisInfo},
};

/// The reqwest-backed homeserver client. Three underlying clients cover the
/// distinct timeout regimes: ordinary calls, long-poll syncs, and streaming
/// media.
pub struct MatrixClient {
	server: Arc<Server>,
	default: reqwest::Client,
	sync: reqwest::Client,
	media: reqwest::Client,
	/// Bare client for probing foreign homeservers; carries no credentials.
	probe: reqwest::Client,
	base: Url,
	sync_base: Url,
	media_base: Url,
}

#[derive(Deserialize)]
struct MatrixErrorBody {
	#[serde(default)]
	errcode: Option<String>,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	retry_after_ms: Option<u64>,
}

impl MatrixClient {
	pub fn new(server: &Arc<Server>) -> Result<Self> {
		let config = server.config.get();
		let timeout = Duration::from_millis(config.request_timeout_ms);

		let base = config.homeserver_url.clone();
		let sync_base = config
			.encryption
			.as_ref()
			.map_or_else(|| base.clone(), |enc| enc.sync_url.clone());
		let media_base = config
			.media_url
			.clone()
			.unwrap_or_else(|| base.clone());

		Ok(Self {
			server: server.clone(),
			default: reqwest::Client::builder()
				.connect_timeout(Duration::from_secs(15))
				.timeout(timeout)
				.build()?,
			sync: reqwest::Client::builder()
				.connect_timeout(Duration::from_secs(15))
				// long-poll plus homeserver-side slack
				.timeout(Duration::from_secs(95))
				.build()?,
			media: reqwest::Client::builder()
				.connect_timeout(Duration::from_secs(15))
				.build()?,
			probe: reqwest::Client::builder()
				.connect_timeout(Duration::from_secs(10))
				.timeout(Duration::from_secs(30))
				.build()?,
			base,
			sync_base,
			media_base,
		})
	}

	fn url(base: &Url, segments: &[&str]) -> Result<Url> {
		let mut url = base.clone();
		url.path_segments_mut()
			.map_err(|()| err!("homeserver URL cannot be a base"))?
			.pop_if_empty()
			.extend(segments);

		Ok(url)
	}

	fn client_url(&self, segments: &[&str]) -> Result<Url> {
		let mut all = vec!["_matrix", "client", "v3"];
		all.extend_from_slice(segments);
		Self::url(&self.base, &all)
	}

	async fn request(
		&self,
		method: Method,
		mut url: Url,
		as_user: Option<&UserId>,
		body: Option<&JsonValue>,
	) -> Result<JsonValue> {
		if let Some(user) = as_user {
			url.query_pairs_mut()
				.append_pair("user_id", user.as_str());
		}

		tracing::trace!(%method, path = url.path(), "homeserver request");

		let mut request = self
			.default
			.request(method, url)
			.bearer_auth(&self.server.registration.as_token);

		if let Some(body) = body {
			request = request.json(body);
		}

		let response = request.send().await.map_err(map_transport)?;
		Self::into_json(response).await
	}

	async fn into_json(response: reqwest::Response) -> Result<JsonValue> {
		let status = response.status();
		if status.is_success() {
			return response.json().await.map_err(map_transport);
		}

		let body: MatrixErrorBody = response
			.json()
			.await
			.unwrap_or(MatrixErrorBody { errcode: None, error: None, retry_after_ms: None });

		Err(Error::from_matrix(
			status,
			body.errcode.as_deref().unwrap_or("M_UNKNOWN"),
			body.error.as_deref().unwrap_or("(no error message)"),
			body.retry_after_ms,
		))
	}
}

fn map_transport(e: reqwest::Error) -> Error {
	if e.is_timeout() {
		err!(UpstreamTimeout("{e}"))
	} else {
		e.into()
	}
}

fn room_id_from(value: &JsonValue) -> Result<OwnedRoomId> {
	let raw = value
		.get("room_id")
		.and_then(JsonValue::as_str)
		.ok_or_else(|| err!(BadValue("response without room_id")))?;

	RoomId::parse(raw).map_err(Into::into)
}

fn event_id_from(value: &JsonValue) -> Result<OwnedEventId> {
	let raw = value
		.get("event_id")
		.and_then(JsonValue::as_str)
		.ok_or_else(|| err!(BadValue("response without event_id")))?;

	EventId::parse(raw).map_err(Into::into)
}

#[async_trait]
impl Homeserver for MatrixClient {
	async fn register_user(&self, localpart: &str) -> Result<()> {
		let url = self.client_url(&["register"])?;
		self.request(
			Method::POST,
			url,
			None,
			Some(&json!({
				"type": "m.login.application_service",
				"username": localpart,
			})),
		)
		.await
		.map(|_| ())
	}

	async fn join_room(
		&self,
		as_user: Option<&UserId>,
		room: &RoomOrAliasId,
		via: &[OwnedServerName],
	) -> Result<OwnedRoomId> {
		let mut url = self.client_url(&["join", room.as_str()])?;
		for server in via {
			url.query_pairs_mut()
				.append_pair("server_name", server.as_str());
		}

		let value = self
			.request(Method::POST, url, as_user, Some(&json!({})))
			.await?;

		room_id_from(&value)
	}

	async fn leave_room(&self, as_user: Option<&UserId>, room: &RoomId) -> Result<()> {
		let url = self.client_url(&["rooms", room.as_str(), "leave"])?;
		self.request(Method::POST, url, as_user, Some(&json!({})))
			.await
			.map(|_| ())
	}

	async fn invite_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
	) -> Result<()> {
		let url = self.client_url(&["rooms", room.as_str(), "invite"])?;
		self.request(Method::POST, url, as_user, Some(&json!({ "user_id": target })))
			.await
			.map(|_| ())
	}

	async fn kick_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
		reason: Option<&str>,
	) -> Result<()> {
		let url = self.client_url(&["rooms", room.as_str(), "kick"])?;
		self.request(
			Method::POST,
			url,
			as_user,
			Some(&json!({ "user_id": target, "reason": reason })),
		)
		.await
		.map(|_| ())
	}

	async fn ban_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
		reason: Option<&str>,
	) -> Result<()> {
		let url = self.client_url(&["rooms", room.as_str(), "ban"])?;
		self.request(
			Method::POST,
			url,
			as_user,
			Some(&json!({ "user_id": target, "reason": reason })),
		)
		.await
		.map(|_| ())
	}

	async fn unban_user(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		target: &UserId,
	) -> Result<()> {
		let url = self.client_url(&["rooms", room.as_str(), "unban"])?;
		self.request(Method::POST, url, as_user, Some(&json!({ "user_id": target })))
			.await
			.map(|_| ())
	}

	async fn joined_members(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
	) -> Result<BTreeMap<OwnedUserId, Profile>> {
		#[derive(Deserialize)]
		struct Joined {
			#[serde(default)]
			joined: BTreeMap<OwnedUserId, JoinedProfile>,
		}

		#[derive(Deserialize)]
		struct JoinedProfile {
			#[serde(default)]
			display_name: Option<String>,
			#[serde(default)]
			avatar_url: Option<OwnedMxcUri>,
		}

		let url = self.client_url(&["rooms", room.as_str(), "joined_members"])?;
		let value = self.request(Method::GET, url, as_user, None).await?;
		let joined: Joined = serde_json::from_value(value)?;

		Ok(joined
			.joined
			.into_iter()
			.map(|(user, p)| {
				(user, Profile { displayname: p.display_name, avatar_url: p.avatar_url })
			})
			.collect())
	}

	async fn resolve_alias(&self, alias: &RoomAliasId) -> Result<OwnedRoomId> {
		let url = self.client_url(&["directory", "room", alias.as_str()])?;
		let value = self.request(Method::GET, url, None, None).await?;
		room_id_from(&value)
	}

	async fn create_room(
		&self,
		as_user: Option<&UserId>,
		options: JsonValue,
	) -> Result<OwnedRoomId> {
		let url = self.client_url(&["createRoom"])?;
		let value = self
			.request(Method::POST, url, as_user, Some(&options))
			.await?;

		room_id_from(&value)
	}

	async fn send_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		content: JsonValue,
	) -> Result<OwnedEventId> {
		let txn_id = TransactionId::new();
		let url = self.client_url(&[
			"rooms",
			room.as_str(),
			"send",
			event_type,
			txn_id.as_str(),
		])?;

		let value = self
			.request(Method::PUT, url, as_user, Some(&content))
			.await?;

		event_id_from(&value)
	}

	async fn send_state_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
		content: JsonValue,
	) -> Result<OwnedEventId> {
		let url =
			self.client_url(&["rooms", room.as_str(), "state", event_type, state_key])?;

		let value = self
			.request(Method::PUT, url, as_user, Some(&content))
			.await?;

		event_id_from(&value)
	}

	async fn room_state(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
	) -> Result<Vec<BridgeEvent>> {
		let url = self.client_url(&["rooms", room.as_str(), "state"])?;
		let value = self.request(Method::GET, url, as_user, None).await?;
		serde_json::from_value(value).map_err(Into::into)
	}

	async fn state_event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
	) -> Result<JsonValue> {
		let url =
			self.client_url(&["rooms", room.as_str(), "state", event_type, state_key])?;

		self.request(Method::GET, url, as_user, None).await
	}

	async fn event(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_id: &EventId,
	) -> Result<BridgeEvent> {
		let url = self.client_url(&["rooms", room.as_str(), "event", event_id.as_str()])?;
		let value = self.request(Method::GET, url, as_user, None).await?;
		serde_json::from_value(value).map_err(Into::into)
	}

	async fn profile(&self, as_user: Option<&UserId>, user: &UserId) -> Result<Profile> {
		let url = self.client_url(&["profile", user.as_str()])?;
		let value = self.request(Method::GET, url, as_user, None).await?;
		serde_json::from_value(value).map_err(Into::into)
	}

	async fn set_displayname(&self, as_user: Option<&UserId>, displayname: &str) -> Result<()> {
		let target = as_user.map_or_else(|| self.server.bot_user_id(), ToOwned::to_owned);
		let url = self.client_url(&["profile", target.as_str(), "displayname"])?;
		self.request(
			Method::PUT,
			url,
			as_user,
			Some(&json!({ "displayname": displayname })),
		)
		.await
		.map(|_| ())
	}

	async fn set_avatar_url(&self, as_user: Option<&UserId>, avatar_url: &MxcUri) -> Result<()> {
		let target = as_user.map_or_else(|| self.server.bot_user_id(), ToOwned::to_owned);
		let url = self.client_url(&["profile", target.as_str(), "avatar_url"])?;
		self.request(
			Method::PUT,
			url,
			as_user,
			Some(&json!({ "avatar_url": avatar_url })),
		)
		.await
		.map(|_| ())
	}

	async fn set_presence(
		&self,
		as_user: Option<&UserId>,
		presence: &str,
		status_msg: Option<&str>,
	) -> Result<()> {
		let target = as_user.map_or_else(|| self.server.bot_user_id(), ToOwned::to_owned);
		let url = self.client_url(&["presence", target.as_str(), "status"])?;

		let mut body = json!({ "presence": presence });
		if let Some(msg) = status_msg {
			body["status_msg"] = msg.into();
		}

		self.request(Method::PUT, url, as_user, Some(&body))
			.await
			.map(|_| ())
	}

	async fn presence(&self, user: &UserId) -> Result<PresenceStatus> {
		let url = self.client_url(&["presence", user.as_str(), "status"])?;
		let value = self.request(Method::GET, url, None, None).await?;
		serde_json::from_value(value).map_err(Into::into)
	}

	async fn send_typing(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		typing: bool,
		timeout_ms: u64,
	) -> Result<()> {
		let target = as_user.map_or_else(|| self.server.bot_user_id(), ToOwned::to_owned);
		let url = self.client_url(&["rooms", room.as_str(), "typing", target.as_str()])?;

		let body = if typing {
			json!({ "typing": true, "timeout": timeout_ms })
		} else {
			json!({ "typing": false })
		};

		self.request(Method::PUT, url, as_user, Some(&body))
			.await
			.map(|_| ())
	}

	async fn send_read_receipt(
		&self,
		as_user: Option<&UserId>,
		room: &RoomId,
		event_id: &EventId,
	) -> Result<()> {
		let url = self.client_url(&["rooms", room.as_str(), "read_markers"])?;
		self.request(
			Method::POST,
			url,
			as_user,
			Some(&json!({ "m.fully_read": event_id, "m.read": event_id })),
		)
		.await
		.map(|_| ())
	}

	async fn create_alias(
		&self,
		as_user: Option<&UserId>,
		alias: &RoomAliasId,
		room: &RoomId,
	) -> Result<()> {
		let url = self.client_url(&["directory", "room", alias.as_str()])?;
		self.request(Method::PUT, url, as_user, Some(&json!({ "room_id": room })))
			.await
			.map(|_| ())
	}

	async fn upload(
		&self,
		as_user: Option<&UserId>,
		bytes: Bytes,
		content_type: Option<&str>,
		filename: Option<&str>,
	) -> Result<OwnedMxcUri> {
		let mut url = Self::url(&self.base, &["_matrix", "media", "v3", "upload"])?;
		if let Some(filename) = filename {
			url.query_pairs_mut()
				.append_pair("filename", filename);
		}
		if let Some(user) = as_user {
			url.query_pairs_mut()
				.append_pair("user_id", user.as_str());
		}

		let response = self
			.default
			.post(url)
			.bearer_auth(&self.server.registration.as_token)
			.header(
				http::header::CONTENT_TYPE,
				content_type.unwrap_or("application/octet-stream"),
			)
			.body(bytes)
			.send()
			.await
			.map_err(map_transport)?;

		let value = Self::into_json(response).await?;
		let raw = value
			.get("content_uri")
			.and_then(JsonValue::as_str)
			.ok_or_else(|| err!(BadValue("upload response without content_uri")))?;

		Ok(OwnedMxcUri::from(raw))
	}

	async fn set_room_directory_visibility(&self, room: &RoomId, visible: bool) -> Result<()> {
		let url = self.client_url(&["directory", "list", "room", room.as_str()])?;
		let visibility = if visible { "public" } else { "private" };
		self.request(Method::PUT, url, None, Some(&json!({ "visibility": visibility })))
			.await
			.map(|_| ())
	}

	async fn set_network_room_visibility(
		&self,
		network_id: &str,
		room: &RoomId,
		visible: bool,
	) -> Result<()> {
		let url = self.client_url(&[
			"directory",
			"list",
			"appservice",
			network_id,
			room.as_str(),
		])?;

		let visibility = if visible { "public" } else { "private" };
		self.request(Method::PUT, url, None, Some(&json!({ "visibility": visibility })))
			.await
			.map(|_| ())
	}

	async fn whois(&self, user: &UserId) -> Result<WhoisInfo> {
		let url =
			Self::url(&self.base, &["_synapse", "admin", "v1", "whois", user.as_str()])?;

		let value = self.request(Method::GET, url, None, None).await?;
		serde_json::from_value(value).map_err(Into::into)
	}

	async fn admin_probe(&self) -> Result<bool> {
		// A whois with no user id should never succeed; 200 or 400 tell us
		// the admin API answered at all.
		let url = Self::url(&self.base, &["_synapse", "admin", "v1", "whois", ""])?;
		let response = self
			.default
			.get(url)
			.bearer_auth(&self.server.registration.as_token)
			.send()
			.await
			.map_err(map_transport)?;

		Ok(matches!(response.status().as_u16(), 200 | 400))
	}

	async fn sync(
		&self,
		as_user: &UserId,
		filter: &JsonValue,
		since: Option<&str>,
		timeout_ms: u64,
	) -> Result<SyncResponse> {
		let mut url = Self::url(&self.sync_base, &["_matrix", "client", "v3", "sync"])?;
		{
			let mut query = url.query_pairs_mut();
			query.append_pair("filter", &filter.to_string());
			query.append_pair("timeout", &timeout_ms.to_string());
			query.append_pair("set_presence", "offline");
			if let Some(since) = since {
				query.append_pair("since", since);
			}
			query.append_pair("user_id", as_user.as_str());
		}

		let response = self
			.sync
			.get(url)
			.bearer_auth(&self.server.registration.as_token)
			.send()
			.await
			.map_err(map_transport)?;

		let value = Self::into_json(response).await?;
		serde_json::from_value(value).map_err(Into::into)
	}

	async fn probe_registration(&self, host: &str) -> Result<RegisterProbe> {
		let url = Url::parse(&format!("https://{host}/_matrix/client/v3/register"))?;
		let response = self
			.probe
			.post(url)
			.json(&json!({}))
			.send()
			.await
			.map_err(map_transport)?;

		let status = response.status().as_u16();
		let body = response
			.json()
			.await
			.unwrap_or(JsonValue::Null);

		Ok(RegisterProbe { status, body })
	}

	async fn download(
		&self,
		mxc: &MxcUri,
		content_token: Option<&str>,
	) -> Result<MediaDownload> {
		let (server_name, media_id) = mxc.parts()?;
		let mut url = Self::url(&self.media_base, &[
			"_matrix",
			"client",
			"v1",
			"media",
			"download",
			server_name.as_str(),
			media_id,
		])?;

		if let Some(token) = content_token {
			url.query_pairs_mut()
				.append_pair("content_token", token);
		}

		let response = self
			.media
			.get(url)
			.bearer_auth(&self.server.registration.as_token)
			.send()
			.await
			.map_err(map_transport)?;

		let status = response.status();
		if !status.is_success() {
			return Err(Self::into_json(response)
				.await
				.err()
				.unwrap_or_else(|| err!(BadValue("media download failed with {status}"))));
		}

		fn header(response: &reqwest::Response, name: http::header::HeaderName) -> Option<String> {
			response
				.headers()
				.get(name)
				.and_then(|v| v.to_str().ok())
				.map(ToOwned::to_owned)
		}

		let content_type = header(&response, http::header::CONTENT_TYPE);
		let content_disposition = header(&response, http::header::CONTENT_DISPOSITION);
		let content_length = response.content_length();

		Ok(MediaDownload {
			content_type,
			content_length,
			content_disposition,
			stream: response
				.bytes_stream()
				.map_err(map_transport)
				.boxed(),
		})
	}
}
