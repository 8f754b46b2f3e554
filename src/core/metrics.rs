use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Process-local counters. Exposition is the embedder's concern; components
/// only record here.
#[derive(Default)]
pub struct Metrics {
	pub requests_handle_active: AtomicUsize,
	pub requests_handle_finished: AtomicU64,
	pub requests_panic: AtomicU64,

	pub transactions_received: AtomicU64,
	pub events_processed: AtomicU64,
	pub events_sent: AtomicU64,

	/// Membership queue items awaiting service.
	pub membership_pending: AtomicI64,

	/// Membership queue outcomes, indexed `[type][outcome]`.
	membership_processed: [[AtomicU64; QueueOutcome::COUNT]; QueueKind::COUNT],

	pub intent_cache_hits: AtomicU64,
	pub intent_cache_misses: AtomicU64,

	pub encrypted_delivered: AtomicU64,
	pub encrypted_deduplicated: AtomicU64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueKind {
	Join,
	Leave,
	Kick,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueOutcome {
	Success,
	Fail,
	Dead,
}

impl QueueKind {
	const COUNT: usize = 3;

	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			| Self::Join => "join",
			| Self::Leave => "leave",
			| Self::Kick => "kick",
		}
	}
}

impl QueueOutcome {
	const COUNT: usize = 3;

	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			| Self::Success => "success",
			| Self::Fail => "fail",
			| Self::Dead => "dead",
		}
	}
}

impl Metrics {
	#[must_use]
	pub fn new() -> Self { Self::default() }

	#[inline]
	pub fn membership_enqueued(&self) {
		self.membership_pending
			.fetch_add(1, Ordering::Relaxed);
	}

	/// Every terminal outcome decrements the pending gauge and bumps the
	/// processed counter for its `(type, outcome)` pair.
	pub fn membership_processed(&self, kind: QueueKind, outcome: QueueOutcome) {
		self.membership_pending
			.fetch_sub(1, Ordering::Relaxed);
		self.membership_processed[kind as usize][outcome as usize]
			.fetch_add(1, Ordering::Relaxed);
	}

	#[must_use]
	pub fn membership_processed_count(&self, kind: QueueKind, outcome: QueueOutcome) -> u64 {
		self.membership_processed[kind as usize][outcome as usize].load(Ordering::Relaxed)
	}

	#[must_use]
	pub fn membership_pending_count(&self) -> i64 {
		self.membership_pending.load(Ordering::Relaxed)
	}
}
