use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

#[inline]
#[must_use]
#[allow(clippy::as_conversions)]
pub fn now_millis() -> u64 {
	UNIX_EPOCH
		.elapsed()
		.expect("positive duration after epoch")
		.as_millis() as u64
}

#[inline]
#[must_use]
pub fn now_secs() -> u64 {
	UNIX_EPOCH
		.elapsed()
		.expect("positive duration after epoch")
		.as_secs()
}

/// The UTC-midnight second bucket containing `secs`.
#[must_use]
pub fn utc_midnight_secs(secs: u64) -> u64 {
	const DAY: u64 = 24 * 60 * 60;

	secs - (secs % DAY)
}

/// Today's UTC-midnight second bucket.
#[must_use]
pub fn utc_today_secs() -> u64 { utc_midnight_secs(now_secs()) }

#[must_use]
pub fn timepoint_from_millis(millis: u64) -> SystemTime {
	UNIX_EPOCH + Duration::from_millis(millis)
}

/// Render a millisecond epoch timestamp for logs and notices.
#[must_use]
pub fn format_millis(millis: u64) -> String {
	DateTime::<Utc>::from(timepoint_from_millis(millis))
		.format("%Y-%m-%d %H:%M:%S%.3f UTC")
		.to_string()
}

#[cfg(test)]
mod tests {
	use super::utc_midnight_secs;

	#[test]
	fn midnight_bucketing() {
		// 2024-01-15 13:37:42 UTC
		let ts = 1_705_325_862;
		let midnight = utc_midnight_secs(ts);
		assert_eq!(midnight % (24 * 60 * 60), 0);
		assert!(ts - midnight < 24 * 60 * 60);
		// idempotent
		assert_eq!(utc_midnight_secs(midnight), midnight);
	}
}
