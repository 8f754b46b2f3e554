//! Memoized-request cache with a TTL and a size bound. Entries expire `ttl`
//! after insertion; on overflow the oldest-inserted entry is dropped. The
//! cache is purely a hint: a miss re-invokes the producer, and concurrent
//! misses may race it, which is harmless for the read-mostly lookups this
//! backs (profiles, room state, events).

use std::{
	borrow::Borrow,
	collections::{HashMap, VecDeque},
	future::Future,
	hash::Hash,
	time::{Duration, Instant},
};

use crate::Result;

pub struct RequestCache<K, V> {
	inner: std::sync::Mutex<Inner<K, V>>,
	ttl: Duration,
	max_size: usize,
}

struct Inner<K, V> {
	entries: HashMap<K, Entry<V>>,
	/// Insertion order; front is oldest.
	order: VecDeque<K>,
}

struct Entry<V> {
	inserted_at: Instant,
	value: V,
}

impl<K, V> RequestCache<K, V>
where
	K: Clone + Eq + Hash,
	V: Clone,
{
	#[must_use]
	pub fn new(ttl: Duration, max_size: usize) -> Self {
		Self {
			inner: std::sync::Mutex::new(Inner {
				entries: HashMap::new(),
				order: VecDeque::new(),
			}),
			ttl,
			max_size,
		}
	}

	/// Fresh value on miss via `producer`; only successful productions are
	/// cached. The lock is not held across the producer await.
	pub async fn get_with<F, Fut>(&self, key: K, producer: F) -> Result<V>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<V>>,
	{
		if let Some(hit) = self.peek(&key) {
			return Ok(hit);
		}

		let value = producer().await?;
		self.insert(key, value.clone());
		Ok(value)
	}

	/// Non-producing lookup. Expired entries are dropped on observation.
	#[must_use]
	pub fn peek<Q>(&self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Eq + Hash + ?Sized,
	{
		let mut inner = self.inner.lock().expect("cache lock poisoned");

		let expired = inner
			.entries
			.get(key)
			.is_some_and(|entry| entry.inserted_at.elapsed() > self.ttl);

		if expired {
			Self::remove(&mut inner, key);
			return None;
		}

		inner
			.entries
			.get(key)
			.map(|entry| entry.value.clone())
	}

	pub fn insert(&self, key: K, value: V) {
		let mut inner = self.inner.lock().expect("cache lock poisoned");

		if inner.entries.contains_key(&key) {
			Self::remove(&mut inner, &key);
		}

		while inner.entries.len() >= self.max_size {
			let Some(oldest) = inner.order.pop_front() else {
				break;
			};
			inner.entries.remove(&oldest);
		}

		inner.order.push_back(key.clone());
		inner
			.entries
			.insert(key, Entry { inserted_at: Instant::now(), value });
	}

	pub fn invalidate<Q>(&self, key: &Q)
	where
		K: Borrow<Q>,
		Q: Eq + Hash + ?Sized,
	{
		let mut inner = self.inner.lock().expect("cache lock poisoned");
		Self::remove(&mut inner, key);
	}

	pub fn clear(&self) {
		let mut inner = self.inner.lock().expect("cache lock poisoned");
		inner.entries.clear();
		inner.order.clear();
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.inner
			.lock()
			.expect("cache lock poisoned")
			.entries
			.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool { self.len() == 0 }

	fn remove<Q>(inner: &mut Inner<K, V>, key: &Q)
	where
		K: Borrow<Q>,
		Q: Eq + Hash + ?Sized,
	{
		if inner.entries.remove(key).is_some() {
			inner.order.retain(|k| k.borrow() != key);
		}
	}
}
