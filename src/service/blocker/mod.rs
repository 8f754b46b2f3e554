//! Two-state user-limit watcher. Transitions only commit when the
//! controller's override succeeds; a failed override leaves the machine in
//! its prior state to be retried on the next count.

use std::sync::Arc;

use mxbridge_core::{Result, error, info};
use tokio::sync::Mutex;

use crate::services::OnceServices;

pub struct Service {
	/// Serializes transitions; holds the current blocked flag.
	state: Mutex<bool>,
	limit: Option<u64>,
	services: Arc<OnceServices>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			state: Mutex::new(false),
			limit: args.server.config.get().user_limit,
			services: args.services.clone(),
		}))
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	#[must_use]
	pub async fn is_blocked(&self) -> bool { *self.state.lock().await }

	pub async fn check_limits(&self, users: u64) {
		let Some(limit) = self.limit else {
			return;
		};

		let mut blocked = self.state.lock().await;
		if users > limit && !*blocked {
			info!(users, limit, "user limit exceeded, blocking bridge");
			match self.services.controller.block_bridge().await {
				| Ok(()) => *blocked = true,
				| Err(e) => error!("failed to block bridge: {e}"),
			}
		} else if users <= limit && *blocked {
			info!(users, limit, "user count back under limit, unblocking bridge");
			match self.services.controller.unblock_bridge().await {
				| Ok(()) => *blocked = false,
				| Err(e) => error!("failed to unblock bridge: {e}"),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::Ordering;

	use crate::test_utils::test_services_with;

	#[tokio::test]
	async fn transitions_follow_the_limit() {
		let harness = test_services_with(|config| {
			config.user_limit = Some(10);
		})
		.await;
		let blocker = &harness.services.services.blocker;

		blocker.check_limits(5).await;
		assert!(!blocker.is_blocked().await);

		blocker.check_limits(11).await;
		assert!(blocker.is_blocked().await);
		assert_eq!(harness.controller.blocks.load(Ordering::Relaxed), 1);

		// staying over the limit does not re-fire the override
		blocker.check_limits(12).await;
		assert_eq!(harness.controller.blocks.load(Ordering::Relaxed), 1);

		blocker.check_limits(10).await;
		assert!(!blocker.is_blocked().await);
		assert_eq!(harness.controller.unblocks.load(Ordering::Relaxed), 1);
	}

	#[tokio::test]
	async fn failed_override_keeps_state() {
		let harness = test_services_with(|config| {
			config.user_limit = Some(1);
		})
		.await;
		let blocker = &harness.services.services.blocker;

		harness
			.controller
			.fail_block
			.store(true, Ordering::Relaxed);

		blocker.check_limits(5).await;
		assert!(!blocker.is_blocked().await);

		// once the override recovers, the transition lands
		harness
			.controller
			.fail_block
			.store(false, Ordering::Relaxed);
		blocker.check_limits(5).await;
		assert!(blocker.is_blocked().await);
	}

	#[tokio::test]
	async fn disabled_without_limit() {
		let harness = test_services_with(|_| {}).await;
		let blocker = &harness.services.services.blocker;

		blocker.check_limits(1_000_000).await;
		assert!(!blocker.is_blocked().await);
	}
}
