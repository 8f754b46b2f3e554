//! Logging surface for the workspace. All crates log through these re-exports
//! so the subscriber configuration lives in one place (the main crate).

pub use ::tracing::{debug, error, info, trace, warn};

/// Log at info level in debug-mode, debug level in release-mode.
#[macro_export]
macro_rules! debug_info {
	($($x:tt)+) => {
		if ::std::cfg!(debug_assertions) {
			$crate::log::info!($($x)+);
		} else {
			$crate::log::debug!($($x)+);
		}
	}
}

/// Log at warn level in debug-mode, debug level in release-mode.
#[macro_export]
macro_rules! debug_warn {
	($($x:tt)+) => {
		if ::std::cfg!(debug_assertions) {
			$crate::log::warn!($($x)+);
		} else {
			$crate::log::debug!($($x)+);
		}
	}
}

/// Log at error level in debug-mode, debug level in release-mode.
#[macro_export]
macro_rules! debug_error {
	($($x:tt)+) => {
		if ::std::cfg!(debug_assertions) {
			$crate::log::error!($($x)+);
		} else {
			$crate::log::debug!($($x)+);
		}
	}
}
