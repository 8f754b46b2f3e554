//! Sharded, linearized, retrying queue for join/leave/kick operations. Rooms
//! hash onto a fixed set of shards; each shard is a FIFO with concurrency
//! one, so membership changes within a room complete in enqueue order.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mxbridge_core::{
	Error, Result, debug, debug_warn, err,
	metrics::{QueueKind, QueueOutcome},
	utils::{Defer, millis_since_unix_epoch, rand::jitter_ms},
	warn,
};
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};

use crate::services::OnceServices;

const RETRY_JITTER_MS: u64 = 500;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueOp {
	Join,
	Leave,
}

#[derive(Clone)]
pub struct QueueItem {
	pub op: QueueOp,
	pub room_id: OwnedRoomId,

	/// The subject of the operation (the user joining, leaving, or being
	/// kicked).
	pub user_id: OwnedUserId,

	/// When set on a leave, this user performs a kick of `user_id` instead.
	pub kick_user: Option<OwnedUserId>,

	pub reason: Option<String>,
	pub attempts: u32,
	pub enqueued_at: u64,
	pub ttl_ms: u64,
	pub retry: bool,
	pub request_id: String,

	notify: Option<Arc<Defer<QueueOutcome>>>,
}

impl QueueItem {
	fn kind(&self) -> QueueKind {
		match (self.op, &self.kick_user) {
			| (QueueOp::Join, _) => QueueKind::Join,
			| (QueueOp::Leave, Some(_)) => QueueKind::Kick,
			| (QueueOp::Leave, None) => QueueKind::Leave,
		}
	}
}

pub struct Service {
	channels: Vec<(loole::Sender<QueueItem>, loole::Receiver<QueueItem>)>,
	services: Arc<OnceServices>,
	max_attempts: u32,
	action_delay_ms: u64,
	max_action_delay_ms: u64,
	default_ttl_ms: u64,
}

#[async_trait]
impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		let config = args.server.config.get();

		Ok(Arc::new(Self {
			channels: (0..config.concurrent_room_limit)
				.map(|_| loole::unbounded())
				.collect(),
			services: args.services.clone(),
			max_attempts: config.membership_max_attempts,
			action_delay_ms: config.action_delay_ms,
			max_action_delay_ms: config.max_action_delay_ms,
			default_ttl_ms: config.membership_ttl_ms,
		}))
	}

	async fn worker(self: Arc<Self>) -> Result {
		let mut workers = tokio::task::JoinSet::new();
		for id in 0..self.channels.len() {
			let this = self.clone();
			workers.spawn_on(this.shard_worker(id), self.services.server.runtime());
		}

		while let Some(joined) = workers.join_next().await {
			match joined {
				| Ok(id) => debug!(?id, "membership shard worker finished"),
				| Err(e) => warn!("membership shard worker finished: {e}"),
			}
		}

		Ok(())
	}

	async fn interrupt(&self) {
		for (sender, _) in &self.channels {
			if !sender.is_closed() {
				sender.close();
			}
		}
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	pub fn queue_join(&self, room_id: &RoomId, user_id: &UserId) -> Arc<Defer<QueueOutcome>> {
		self.queue(QueueItem {
			op: QueueOp::Join,
			room_id: room_id.to_owned(),
			user_id: user_id.to_owned(),
			kick_user: None,
			reason: None,
			attempts: 0,
			enqueued_at: millis_since_unix_epoch(),
			ttl_ms: self.default_ttl_ms,
			retry: true,
			request_id: mxbridge_core::utils::random_string(12),
			notify: None,
		})
	}

	pub fn queue_leave(
		&self,
		room_id: &RoomId,
		user_id: &UserId,
		reason: Option<String>,
	) -> Arc<Defer<QueueOutcome>> {
		self.queue(QueueItem {
			op: QueueOp::Leave,
			room_id: room_id.to_owned(),
			user_id: user_id.to_owned(),
			kick_user: None,
			reason,
			attempts: 0,
			enqueued_at: millis_since_unix_epoch(),
			ttl_ms: self.default_ttl_ms,
			retry: true,
			request_id: mxbridge_core::utils::random_string(12),
			notify: None,
		})
	}

	/// `kicker` performs the kick of `target`.
	pub fn queue_kick(
		&self,
		room_id: &RoomId,
		target: &UserId,
		kicker: &UserId,
		reason: Option<String>,
	) -> Arc<Defer<QueueOutcome>> {
		self.queue(QueueItem {
			op: QueueOp::Leave,
			room_id: room_id.to_owned(),
			user_id: target.to_owned(),
			kick_user: Some(kicker.to_owned()),
			reason,
			attempts: 0,
			enqueued_at: millis_since_unix_epoch(),
			ttl_ms: self.default_ttl_ms,
			retry: true,
			request_id: mxbridge_core::utils::random_string(12),
			notify: None,
		})
	}

	/// Enqueue with full control over TTL and retry; returns a handle that
	/// resolves with the terminal outcome.
	pub fn queue(&self, mut item: QueueItem) -> Arc<Defer<QueueOutcome>> {
		let notify = item
			.notify
			.get_or_insert_with(|| Arc::new(Defer::new()))
			.clone();
		let kind = item.kind();

		self.services.server.metrics.membership_enqueued();
		if let Err(e) = self.dispatch(item) {
			warn!("membership queue dispatch failed: {e}");
			self.services
				.server
				.metrics
				.membership_processed(kind, QueueOutcome::Fail);
			notify.resolve(QueueOutcome::Fail);
		}

		notify
	}

	fn dispatch(&self, item: QueueItem) -> Result {
		let shard = self.shard_id(&item.room_id);
		let sender = &self
			.channels
			.get(shard)
			.expect("missing shard channel")
			.0;

		sender.send(item).map_err(|e| err!("{e}"))
	}

	/// `shard = (Σ char codes of roomId) mod concurrentRoomLimit`
	fn shard_id(&self, room_id: &RoomId) -> usize {
		let shards = self.channels.len().max(1);
		let sum: u64 = room_id
			.as_str()
			.chars()
			.map(|c| u64::from(u32::from(c)))
			.sum();

		usize::try_from(sum % shards as u64).unwrap_or(0)
	}

	async fn shard_worker(self: Arc<Self>, id: usize) -> usize {
		let receiver = self
			.channels
			.get(id)
			.map(|(_, receiver)| receiver.clone())
			.expect("missing shard channel");

		while let Ok(item) = receiver.recv_async().await {
			self.service_item(item).await;
		}

		id
	}

	async fn service_item(&self, item: QueueItem) {
		let metrics = &self.services.server.metrics;
		let kind = item.kind();

		let age = millis_since_unix_epoch().saturating_sub(item.enqueued_at);
		if age > item.ttl_ms {
			debug_warn!(
				request_id = %item.request_id,
				room = %item.room_id,
				age_ms = age,
				"membership request expired before service"
			);
			metrics.membership_processed(kind, QueueOutcome::Dead);
			if let Some(notify) = &item.notify {
				notify.resolve(QueueOutcome::Dead);
			}
			return;
		}

		let actor = item.kick_user.as_deref().unwrap_or(&item.user_id);
		let intent = self.services.intent.get(actor);

		let result = match (item.op, &item.kick_user) {
			| (QueueOp::Join, _) => intent
				.ensure_joined_with(&item.room_id, false, &[], true)
				.await,
			| (QueueOp::Leave, Some(_)) => intent
				.kick(&item.room_id, &item.user_id, item.reason.as_deref())
				.await,
			| (QueueOp::Leave, None) => intent
				.leave(&item.room_id, item.reason.as_deref())
				.await,
		};

		match result {
			| Ok(()) => {
				metrics.membership_processed(kind, QueueOutcome::Success);
				if let Some(notify) = &item.notify {
					notify.resolve(QueueOutcome::Success);
				}
			},
			| Err(e) => self.handle_failure(item, kind, &e).await,
		}
	}

	async fn handle_failure(&self, item: QueueItem, kind: QueueKind, error: &Error) {
		let metrics = &self.services.server.metrics;
		let attempts = item.attempts.saturating_add(1);

		let exhausted = attempts >= self.max_attempts;
		let permanent = error.is_permanent() || !item.retry;
		if exhausted || permanent {
			warn!(
				request_id = %item.request_id,
				room = %item.room_id,
				user = %item.user_id,
				attempts,
				"membership request failed: {error}"
			);
			metrics.membership_processed(kind, QueueOutcome::Fail);
			if let Some(notify) = &item.notify {
				notify.resolve(QueueOutcome::Fail);
			}
			return;
		}

		let delay = (self.action_delay_ms.saturating_mul(u64::from(attempts)))
			.saturating_add(jitter_ms(RETRY_JITTER_MS))
			.min(self.max_action_delay_ms);

		debug!(
			request_id = %item.request_id,
			attempts,
			delay_ms = delay,
			"retrying membership request: {error}"
		);

		tokio::time::sleep(Duration::from_millis(delay)).await;

		let requeued = QueueItem { attempts, ..item };
		if let Err(e) = self.dispatch(requeued) {
			debug_warn!("re-enqueue failed during shutdown: {e}");
			metrics.membership_processed(kind, QueueOutcome::Fail);
		}
	}
}
