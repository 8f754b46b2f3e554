//! `Defer<T>`: a promise/resolver pair. Many waiters may clone the shared
//! future; the first `resolve` wins and later calls are ignored.

use std::sync::Mutex;

use futures::{FutureExt, future::Shared};
use tokio::sync::oneshot;

pub struct Defer<T: Clone> {
	tx: Mutex<Option<oneshot::Sender<T>>>,
	rx: Shared<futures::future::BoxFuture<'static, Option<T>>>,
}

impl<T: Clone + Send + 'static> Default for Defer<T> {
	fn default() -> Self { Self::new() }
}

impl<T: Clone + Send + 'static> Defer<T> {
	#[must_use]
	pub fn new() -> Self {
		let (tx, rx) = oneshot::channel::<T>();
		Self {
			tx: Mutex::new(Some(tx)),
			rx: rx.map(Result::ok).boxed().shared(),
		}
	}

	/// Resolve all current and future waiters. Returns false if already
	/// resolved or all waiters dropped.
	pub fn resolve(&self, value: T) -> bool {
		self.tx
			.lock()
			.expect("defer lock poisoned")
			.take()
			.is_some_and(|tx| tx.send(value).is_ok())
	}

	#[must_use]
	pub fn is_resolved(&self) -> bool {
		self.tx
			.lock()
			.expect("defer lock poisoned")
			.is_none()
	}

	/// Await resolution. `None` only if the resolver was dropped unresolved.
	pub async fn wait(&self) -> Option<T> { self.rx.clone().await }
}
