use std::sync::{Arc, RwLock};

use super::Config;

/// Holds the live configuration snapshot. Readers take a cheap `Arc` clone;
/// a SIGHUP reload swaps the snapshot wholesale so in-flight work keeps a
/// consistent view.
pub struct Manager {
	current: RwLock<Arc<Config>>,
}

impl Manager {
	#[must_use]
	pub fn new(config: Config) -> Self {
		Self { current: RwLock::new(Arc::new(config)) }
	}

	#[must_use]
	pub fn get(&self) -> Arc<Config> {
		self.current
			.read()
			.expect("config lock poisoned")
			.clone()
	}

	/// Swap in a reloaded configuration; returns the previous snapshot.
	pub fn reload(&self, config: Config) -> Arc<Config> {
		let mut guard = self
			.current
			.write()
			.expect("config lock poisoned");

		std::mem::replace(&mut guard, Arc::new(config))
	}
}
