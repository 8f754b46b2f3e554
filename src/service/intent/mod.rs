mod backing;
#[allow(clippy::module_inception)]
mod intent;

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use mxbridge_core::{BridgeEvent, Result, debug, utils::millis_since_unix_epoch};
use ruma::{OwnedUserId, UserId};

pub use self::{
	backing::{CacheBacking, IntentBacking, LocalBacking},
	intent::{CreateRoomOpts, Intent},
};
use crate::services::OnceServices;

/// The intent pool: one lazily-created [`Intent`] per virtual user, culled
/// when idle unless the encrypted-event broker is using it.
pub struct Service {
	intents: Mutex<HashMap<OwnedUserId, Arc<Intent>>>,
	backing: Arc<dyn IntentBacking>,
	services: Arc<OnceServices>,
}

#[async_trait]
impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			intents: Mutex::new(HashMap::new()),
			backing: Arc::new(CacheBacking::new(
				args.services.membership_cache.clone(),
			)),
			services: args.services.clone(),
		}))
	}

	async fn worker(self: Arc<Self>) -> Result {
		let cull_after = self
			.services
			.server
			.config
			.get()
			.intent_cull_after_ms;

		let interval = Duration::from_millis(cull_after.max(1000) / 2);
		loop {
			tokio::select! {
				() = self.services.server.until_shutdown() => break,
				() = tokio::time::sleep(interval) => self.cull(cull_after).await,
			}
		}

		Ok(())
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	pub fn get(&self, user_id: &UserId) -> Arc<Intent> {
		let is_bot = self.services.globals.is_bot(user_id);
		self.intents
			.lock()
			.expect("intent pool")
			.entry(user_id.to_owned())
			.or_insert_with(|| {
				Arc::new(Intent::new(
					user_id.to_owned(),
					is_bot,
					self.services.clone(),
					self.backing.clone(),
				))
			})
			.clone()
	}

	pub fn bot(&self) -> Arc<Intent> { self.get(self.services.globals.bot_user_id()) }

	/// Fan a state event into every pooled intent's cache maintenance.
	pub fn on_event(&self, event: &BridgeEvent) {
		let intents: Vec<_> = self
			.intents
			.lock()
			.expect("intent pool")
			.values()
			.cloned()
			.collect();

		for intent in intents {
			intent.on_event(event);
		}
	}

	/// Evict intents idle beyond `cull_after`. The bot never culls; users
	/// owning an encrypted sync are protected, and a stopped sync is a
	/// precondition for everyone else.
	async fn cull(&self, cull_after_ms: u64) {
		let now = millis_since_unix_epoch();
		let candidates: Vec<(OwnedUserId, Arc<Intent>)> = self
			.intents
			.lock()
			.expect("intent pool")
			.iter()
			.map(|(user, intent)| (user.clone(), intent.clone()))
			.collect();

		for (user, intent) in candidates {
			if intent.is_bot() {
				continue;
			}

			let idle = now.saturating_sub(
				intent
					.last_used
					.load(std::sync::atomic::Ordering::Relaxed),
			);
			if idle < cull_after_ms {
				continue;
			}

			if self.services.encryption.protects(&user) {
				continue;
			}

			self.services.encryption.stop_sync_for(&user).await;
			self.intents
				.lock()
				.expect("intent pool")
				.remove(&user);
			debug!(user = %user, idle_ms = idle, "culled idle intent");
		}
	}

	#[cfg(test)]
	pub(crate) fn pooled_count(&self) -> usize {
		self.intents.lock().expect("intent pool").len()
	}
}
