use std::{
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::SystemTime,
};

use ruma::OwnedServerName;
use tokio::{runtime, sync::broadcast};

use crate::{Err, Result, config, config::Registration, metrics::Metrics};

/// Bridge runtime state; public portion shared by every subsystem.
pub struct Server {
	/// Configured name of the homeserver this bridge serves. Same as the one
	/// in the config; reference this instead.
	pub name: OwnedServerName,

	/// Process-wide configuration instance.
	pub config: config::Manager,

	/// The appservice registration this process runs under.
	pub registration: Registration,

	/// Timestamp the bridge was started; used for uptime.
	pub started: SystemTime,

	/// Shutdown pending indicator. Observable on shutdown; do not modify.
	pub stopping: AtomicBool,

	/// Reload desired indicator, set while a SIGHUP reload is in progress.
	pub reloading: AtomicBool,

	/// Handle to the runtime.
	pub runtime: Option<runtime::Handle>,

	/// Reload/shutdown signal.
	pub signal: broadcast::Sender<&'static str>,

	/// Metrics subsystem state.
	pub metrics: Metrics,
}

impl Server {
	#[must_use]
	pub fn new(
		config: config::Config,
		registration: Registration,
		runtime: Option<runtime::Handle>,
	) -> Self {
		Self {
			name: config.server_name.clone(),
			config: config::Manager::new(config),
			registration,
			started: SystemTime::now(),
			stopping: AtomicBool::new(false),
			reloading: AtomicBool::new(false),
			runtime,
			signal: broadcast::channel::<&'static str>(1).0,
			metrics: Metrics::new(),
		}
	}

	pub fn reload(&self) -> Result {
		if self.reloading.swap(true, Ordering::AcqRel) {
			return Err!("Reload already in progress");
		}

		self.signal("SIGHUP").inspect_err(|_| {
			self.reloading.store(false, Ordering::Release);
		})
	}

	pub fn shutdown(&self) -> Result {
		if self.stopping.swap(true, Ordering::AcqRel) {
			return Err!("Shutdown already in progress");
		}

		self.signal("SIGTERM").inspect_err(|_| {
			self.stopping.store(false, Ordering::Release);
		})
	}

	pub fn signal(&self, sig: &'static str) -> Result {
		self.signal.send(sig).ok();
		Ok(())
	}

	#[inline]
	pub async fn until_shutdown(self: &Arc<Self>) {
		// subscribe before the running check so a signal sent in between
		// cannot be missed
		let mut signal = self.signal.subscribe();
		while self.running() {
			signal.recv().await.ok();
		}
	}

	#[inline]
	pub fn runtime(&self) -> &runtime::Handle {
		self.runtime
			.as_ref()
			.expect("runtime handle available in Server")
	}

	#[inline]
	pub fn check_running(&self) -> Result {
		use std::{io, io::ErrorKind::Interrupted};

		self.running()
			.then_some(())
			.ok_or_else(|| io::Error::new(Interrupted, "Bridge shutting down"))
			.map_err(Into::into)
	}

	#[inline]
	pub fn running(&self) -> bool { !self.is_stopping() }

	#[inline]
	pub fn is_stopping(&self) -> bool { self.stopping.load(Ordering::Relaxed) }

	#[inline]
	pub fn is_reloading(&self) -> bool { self.reloading.load(Ordering::Relaxed) }

	#[inline]
	pub fn is_ours(&self, name: &str) -> bool { name == self.name.as_str() }

	/// The fully-qualified user ID of the bridge bot.
	#[must_use]
	pub fn bot_user_id(&self) -> ruma::OwnedUserId {
		ruma::UserId::parse_with_server_name(
			self.registration.sender_localpart.as_str(),
			&self.name,
		)
		.expect("sender_localpart forms a valid user ID")
	}
}
