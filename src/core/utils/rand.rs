use rand::{Rng, distributions::Alphanumeric, thread_rng};

/// Random alphanumeric string, e.g. for registration tokens and txn ids.
#[must_use]
pub fn string(length: usize) -> String {
	thread_rng()
		.sample_iter(Alphanumeric)
		.take(length)
		.map(char::from)
		.collect()
}

/// Uniform jitter in `0..bound` milliseconds; 0 when the bound is 0.
#[must_use]
pub fn jitter_ms(bound: u64) -> u64 {
	if bound == 0 {
		return 0;
	}

	thread_rng().gen_range(0..bound)
}

/// Signed jitter in `-bound..=bound`, for spreading cache expirations.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn jitter_signed_ms(bound: u64) -> i64 {
	if bound == 0 {
		return 0;
	}

	thread_rng().gen_range(-(bound as i64)..=(bound as i64))
}

#[cfg(test)]
mod tests {
	#[test]
	fn string_has_requested_length() {
		let s = super::string(64);
		assert_eq!(s.len(), 64);
		assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
	}

	#[test]
	fn jitter_respects_bounds() {
		for _ in 0..100 {
			assert!(super::jitter_ms(500) < 500);
			let signed = super::jitter_signed_ms(60_000);
			assert!((-60_000..=60_000).contains(&signed));
		}
		assert_eq!(super::jitter_ms(0), 0);
	}
}
