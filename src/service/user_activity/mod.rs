//! Rolling daily-active-user accounting. Each user carries a deduplicated,
//! descending list of UTC-midnight buckets capped at 31 entries; the active
//! flag turns on once enough distinct days land inside the window and then
//! sticks. Changes are coalesced and reported after a quiet period.

use std::sync::Arc;

use async_trait::async_trait;
use mxbridge_core::{
	Result, debug, error,
	utils::time::{now_secs, utc_midnight_secs},
};
use ruma::UserId;

use crate::{
	services::OnceServices,
	store::{UserActivityRecord, UserActivityStore},
};

const MAX_TS_ENTRIES: usize = 31;
const DAY_SECS: u64 = 24 * 60 * 60;

pub struct Service {
	store: Arc<dyn UserActivityStore>,
	changed: (loole::Sender<()>, loole::Receiver<()>),
	services: Arc<OnceServices>,
}

#[async_trait]
impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			store: args.stores.activity.clone(),
			changed: loole::unbounded(),
			services: args.services.clone(),
		}))
	}

	/// Debounce worker: coalesce change signals, then report the active-user
	/// count to the controller and the bridge blocker.
	async fn worker(self: Arc<Self>) -> Result {
		let debounce = std::time::Duration::from_millis(
			self.services
				.server
				.config
				.get()
				.activity_debounce_ms,
		);

		let receiver = self.changed.1.clone();
		while let Ok(()) = receiver.recv_async().await {
			// quiet period: keep absorbing signals until none arrive
			loop {
				match tokio::time::timeout(debounce, receiver.recv_async()).await {
					| Ok(Ok(())) => continue,
					| Ok(Err(_)) | Err(_) => break,
				}
			}

			match self.count_active_users().await {
				| Ok(count) => {
					debug!(count, "active-user count changed");
					self.services
						.blocker
						.check_limits(count)
						.await;

					if let Err(e) = self
						.services
						.controller
						.on_user_activity_changed(count)
						.await
					{
						error!("user-activity callback failed: {e}");
					}
				},
				| Err(e) => error!("failed to count active users: {e}"),
			}
		}

		Ok(())
	}

	async fn interrupt(&self) {
		let (sender, _) = &self.changed;
		if !sender.is_closed() {
			sender.close();
		}
	}

	fn name(&self) -> &str { crate::service::make_name(std::module_path!()) }
}

impl Service {
	/// Record activity for `user` today. Idempotent per UTC day.
	pub async fn record_active(&self, user_id: &UserId, private: bool) -> Result {
		let config = self.services.server.config.get();
		let today = utc_midnight_secs(now_secs());

		let mut record = self
			.store
			.get_activity(user_id)
			.await?
			.unwrap_or_default();

		if private {
			record.metadata.private = Some(true);
		}

		let changed = !record.ts.contains(&today);
		if changed {
			record.ts.push(today);
			record.ts.sort_unstable_by(|a, b| b.cmp(a));
			record.ts.truncate(MAX_TS_ENTRIES);
		}

		// the active flag is sticky once earned
		if record.metadata.active != Some(true) {
			let min_days = u64::from(config.min_user_active_days);
			let window_start = today.saturating_sub(min_days.saturating_mul(DAY_SECS));
			let days_in_window = record
				.ts
				.iter()
				.filter(|&&ts| ts >= window_start)
				.count() as u64;

			if days_in_window >= min_days {
				record.metadata.active = Some(true);
			}
		}

		if changed || record.metadata.active == Some(true) {
			self.store
				.set_activity(user_id, record)
				.await?;
		}

		if changed {
			self.changed.0.send(()).ok();
		}

		Ok(())
	}

	/// Users with any activity inside the `inactive_after_days` window.
	pub async fn count_active_users(&self) -> Result<u64> {
		let config = self.services.server.config.get();
		let cutoff = utc_midnight_secs(now_secs())
			.saturating_sub(u64::from(config.inactive_after_days).saturating_mul(DAY_SECS));

		let count = self
			.store
			.all_activity()
			.await?
			.iter()
			.filter(|(_, record)| record.ts.iter().any(|&ts| ts >= cutoff))
			.count();

		Ok(count as u64)
	}

	pub async fn get_activity(&self, user_id: &UserId) -> Result<Option<UserActivityRecord>> {
		self.store.get_activity(user_id).await
	}
}

#[cfg(test)]
mod tests {
	use ruma::user_id;

	use crate::{
		store::{UserActivityMetadata, UserActivityRecord},
		test_utils::test_services_with,
	};

	const DAY: u64 = 24 * 60 * 60;

	#[tokio::test]
	async fn entries_are_deduplicated_per_day_and_bounded() {
		let harness = test_services_with(|_| {}).await;
		let tracker = &harness.services.services.user_activity;
		let store = &harness.services.services.store.activity;
		let user = user_id!("@chatty:example.org");

		// seed a month's worth of history plus junk beyond the cap
		let today = mxbridge_core::utils::time::utc_midnight_secs(
			mxbridge_core::utils::time::now_secs(),
		);
		let ts: Vec<u64> = (1..=40).map(|d| today - d * DAY).collect();
		store
			.set_activity(user, UserActivityRecord {
				ts,
				metadata: UserActivityMetadata::default(),
			})
			.await
			.unwrap();

		tracker.record_active(user, false).await.unwrap();
		tracker.record_active(user, false).await.unwrap();

		let record = tracker.get_activity(user).await.unwrap().unwrap();
		assert!(record.ts.len() <= 31);
		assert_eq!(record.ts.iter().filter(|&&t| t == today).count(), 1);
		// sorted descending
		assert!(record.ts.windows(2).all(|w| w[0] > w[1]));
	}

	#[tokio::test]
	async fn active_flag_turns_on_at_threshold_and_sticks() {
		let harness = test_services_with(|config| {
			config.min_user_active_days = 3;
		})
		.await;
		let tracker = &harness.services.services.user_activity;
		let store = &harness.services.services.store.activity;
		let user = user_id!("@regular:example.org");

		let today = mxbridge_core::utils::time::utc_midnight_secs(
			mxbridge_core::utils::time::now_secs(),
		);

		// two recent days: not active yet
		store
			.set_activity(user, UserActivityRecord {
				ts: vec![today - DAY, today - 2 * DAY],
				metadata: UserActivityMetadata::default(),
			})
			.await
			.unwrap();

		tracker.record_active(user, false).await.unwrap();
		let record = tracker.get_activity(user).await.unwrap().unwrap();
		assert_eq!(record.metadata.active, Some(true));

		// stickiness: wipe the history, the flag survives
		store
			.set_activity(user, UserActivityRecord {
				ts: Vec::new(),
				metadata: record.metadata.clone(),
			})
			.await
			.unwrap();

		tracker.record_active(user, false).await.unwrap();
		let record = tracker.get_activity(user).await.unwrap().unwrap();
		assert_eq!(record.metadata.active, Some(true));
	}

	#[tokio::test]
	async fn count_honours_inactivity_window() {
		let harness = test_services_with(|config| {
			config.inactive_after_days = 7;
		})
		.await;
		let tracker = &harness.services.services.user_activity;
		let store = &harness.services.services.store.activity;

		let today = mxbridge_core::utils::time::utc_midnight_secs(
			mxbridge_core::utils::time::now_secs(),
		);

		store
			.set_activity(user_id!("@fresh:example.org"), UserActivityRecord {
				ts: vec![today - DAY],
				metadata: UserActivityMetadata::default(),
			})
			.await
			.unwrap();
		store
			.set_activity(user_id!("@stale:example.org"), UserActivityRecord {
				ts: vec![today - 10 * DAY],
				metadata: UserActivityMetadata::default(),
			})
			.await
			.unwrap();

		assert_eq!(tracker.count_active_users().await.unwrap(), 1);
	}
}
