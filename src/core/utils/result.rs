pub type Result<T = (), E = crate::Error> = std::result::Result<T, E>;

/// Log an `Err` and keep going, for best-effort paths where a failure must
/// not unwind the surrounding flow.
pub trait LogErr<T, E>
where
	E: std::fmt::Display,
{
	#[must_use]
	fn log_err(self) -> Self;

	#[must_use]
	fn log_debug_err(self) -> Self;
}

impl<T, E: std::fmt::Display> LogErr<T, E> for Result<T, E> {
	#[inline]
	fn log_err(self) -> Self {
		self.inspect_err(|e| tracing::error!("{e}"))
	}

	#[inline]
	fn log_debug_err(self) -> Self {
		self.inspect_err(|e| tracing::debug!("{e}"))
	}
}
