use std::{ops::Deref, sync::Arc, sync::OnceLock};

use async_trait::async_trait;
use mxbridge_client::Homeserver;
use mxbridge_core::{Result, Server};

use crate::{controller::BridgeController, services::OnceServices, store::Stores};

/// Inputs available while constructing a service.
pub(crate) struct Args<'a> {
	pub server: &'a Arc<Server>,
	pub client: &'a Arc<dyn Homeserver>,
	pub controller: &'a Arc<dyn BridgeController>,
	pub services: &'a Arc<OnceServices>,
	pub stores: &'a Stores,
}

/// A component of the bridge. Construction is synchronous and infallible in
/// spirit; long-running behavior lives in `worker()`, which is spawned on the
/// server runtime and told to wind down through `interrupt()`.
#[async_trait]
pub(crate) trait Service: Send + Sync {
	fn build(args: &Args<'_>) -> Result<Arc<Self>>
	where
		Self: Sized;

	/// Long-running worker; the default has none.
	async fn worker(self: Arc<Self>) -> Result { Ok(()) }

	/// Interrupt the worker; called on shutdown before awaiting workers.
	async fn interrupt(&self) {}

	fn name(&self) -> &str;
}

/// Derive a service name from its module path.
pub(crate) fn make_name(module_path: &str) -> &str {
	module_path
		.rsplit("::")
		.next()
		.unwrap_or(module_path)
}

/// A lazily-bound handle to a sibling service. All handles are bound before
/// any worker starts, so dereferencing from operational code never observes
/// an unbound handle.
pub struct Dep<S> {
	dep: OnceLock<Arc<S>>,
}

impl<S> Dep<S> {
	pub(crate) fn bind(&self, service: Arc<S>) {
		assert!(self.dep.set(service).is_ok(), "service bound twice");
	}
}

impl<S> Default for Dep<S> {
	fn default() -> Self { Self { dep: OnceLock::new() } }
}

impl<S> Deref for Dep<S> {
	type Target = Arc<S>;

	fn deref(&self) -> &Self::Target {
		self.dep
			.get()
			.expect("service initialized before use")
	}
}
