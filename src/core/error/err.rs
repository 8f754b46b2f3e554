//! Error construction macros. A light rendition of the usual
//! `err!(Variant("format {args}"))` shorthand: the `Request(..)` form exists
//! so homeserver-flavored call sites read the same as elsewhere.

#[macro_export]
macro_rules! err {
	(Config($item:literal, $($args:tt)+)) => {
		$crate::error::Error::Config($item, ::std::format!($($args)+).into())
	};

	(Request($variant:ident($($args:tt)+))) => {
		$crate::error::Error::$variant(::std::format!($($args)+).into())
	};

	($variant:ident($($args:tt)+)) => {
		$crate::error::Error::$variant(::std::format!($($args)+).into())
	};

	($($args:tt)+) => {
		$crate::error::Error::Err(::std::format!($($args)+).into())
	};
}

/// Shorthand for `Err(err!(..))`.
#[macro_export]
#[allow(non_snake_case)]
macro_rules! Err {
	($($args:tt)+) => {
		Err($crate::err!($($args)+))
	};
}
