mod err;

use std::borrow::Cow;

/// Stable error vocabulary for the bridge, independent of transport. The
/// homeserver-facing variants are produced by the client from Matrix errcodes
/// and HTTP statuses; everything else wraps infrastructure failures.
#[derive(thiserror::Error)]
pub enum Error {
	#[error("forbidden by homeserver: {0}")]
	Forbidden(Cow<'static, str>),
	#[error("not found: {0}")]
	NotFound(Cow<'static, str>),
	#[error("user ID already taken: {0}")]
	UserInUse(Cow<'static, str>),
	#[error("user ID outside exclusive namespace: {0}")]
	Exclusive(Cow<'static, str>),
	#[error("rate limited by homeserver")]
	RateLimited { retry_after_ms: Option<u64> },
	#[error("bad value: {0}")]
	BadValue(Cow<'static, str>),
	#[error("upstream request timed out: {0}")]
	UpstreamTimeout(Cow<'static, str>),
	#[error("membership request expired before it could be serviced")]
	Dead,

	/// Any other homeserver error response, preserved verbatim.
	#[error("homeserver returned {errcode}: {message}")]
	Matrix {
		errcode: String,
		message: String,
		status: http::StatusCode,
	},

	// Signaled back into Matrix via the unstable bridge-error event.
	#[error("event was not handled by the bridge")]
	EventNotHandled,
	#[error("event was dropped as too old")]
	EventTooOld,
	#[error("foreign network error: {0}")]
	ForeignNetworkError(Cow<'static, str>),
	#[error("event is unknown to the bridge")]
	EventUnknown,
	#[error("internal bridge error: {0}")]
	BridgeInternalError(Cow<'static, str>),

	#[error("There was a problem with the '{0}' directive in your configuration: {1}")]
	Config(&'static str, Cow<'static, str>),
	#[error("store error: {0}")]
	Database(Cow<'static, str>),

	// std
	#[error(transparent)]
	Fmt(#[from] std::fmt::Error),
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	FromUtf8(#[from] std::string::FromUtf8Error),
	#[error(transparent)]
	SystemTime(#[from] std::time::SystemTimeError),
	#[error(transparent)]
	TryFromInt(#[from] std::num::TryFromIntError),
	#[error(transparent)]
	Utf8(#[from] std::str::Utf8Error),

	// third-party
	#[error(transparent)]
	Figment(#[from] figment::error::Error),
	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	HttpHeader(#[from] http::header::InvalidHeaderValue),
	#[error("Join error: {0}")]
	JoinError(#[from] tokio::task::JoinError),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	Mxid(#[from] ruma::IdParseError),
	#[error(transparent)]
	MxcUri(#[from] ruma::MxcUriError),
	#[error("Regex error: {0}")]
	Regex(#[from] regex::Error),
	#[error("Request error: {0}")]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),
	#[error(transparent)]
	Yaml(#[from] serde_yaml::Error),

	// unique / untyped
	#[error("{0}")]
	Err(Cow<'static, str>),
}

impl Error {
	/// Classify a Matrix error response into the stable vocabulary.
	#[must_use]
	pub fn from_matrix(
		status: http::StatusCode,
		errcode: &str,
		message: &str,
		retry_after_ms: Option<u64>,
	) -> Self {
		let message = || Cow::Owned(message.to_owned());
		match (errcode, status.as_u16()) {
			| ("M_FORBIDDEN", _) | (_, 403) => Self::Forbidden(message()),
			| ("M_NOT_FOUND", _) | (_, 404) => Self::NotFound(message()),
			| ("M_USER_IN_USE", _) => Self::UserInUse(message()),
			| ("M_EXCLUSIVE", _) => Self::Exclusive(message()),
			| ("M_LIMIT_EXCEEDED", _) | (_, 429) => Self::RateLimited { retry_after_ms },
			| _ => Self::Matrix {
				errcode: errcode.to_owned(),
				message: message().into_owned(),
				status,
			},
		}
	}

	/// The Matrix errcode string for this error, used on HTTP surfaces.
	#[must_use]
	pub fn errcode(&self) -> &str {
		match self {
			| Self::Forbidden(..) => "M_FORBIDDEN",
			| Self::NotFound(..) | Self::Dead => "M_NOT_FOUND",
			| Self::UserInUse(..) => "M_USER_IN_USE",
			| Self::Exclusive(..) => "M_EXCLUSIVE",
			| Self::RateLimited { .. } => "M_LIMIT_EXCEEDED",
			| Self::BadValue(..) | Self::Mxid(..) | Self::Json(..) => "M_BAD_JSON",
			| Self::Matrix { errcode, .. } => errcode,
			| _ => "M_UNKNOWN",
		}
	}

	/// HTTP status code or the closest approximation for this variant.
	#[must_use]
	pub fn status_code(&self) -> http::StatusCode {
		use http::StatusCode;

		match self {
			| Self::Forbidden(..) => StatusCode::FORBIDDEN,
			| Self::NotFound(..) | Self::Dead => StatusCode::NOT_FOUND,
			| Self::UserInUse(..) | Self::Exclusive(..) => StatusCode::BAD_REQUEST,
			| Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			| Self::BadValue(..) | Self::Mxid(..) | Self::Json(..) => StatusCode::BAD_REQUEST,
			| Self::UpstreamTimeout(..) => StatusCode::GATEWAY_TIMEOUT,
			| Self::Matrix { status, .. } => *status,
			| Self::Reqwest(error) => error
				.status()
				.map(|s| StatusCode::from_u16(s.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY))
				.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
			| _ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	#[inline]
	#[must_use]
	pub fn is_forbidden(&self) -> bool { matches!(self, Self::Forbidden(..)) }

	#[inline]
	#[must_use]
	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound(..)) || self.status_code() == http::StatusCode::NOT_FOUND
	}

	/// True for register conflicts which ensure_registered treats as success.
	#[inline]
	#[must_use]
	pub fn is_register_conflict(&self) -> bool {
		matches!(self, Self::UserInUse(..) | Self::Exclusive(..))
	}

	/// True when a membership-queue item must not be retried; attempt
	/// exhaustion is checked separately, this covers only the status classes.
	#[must_use]
	pub fn is_permanent(&self) -> bool {
		self.is_forbidden()
			|| matches!(
				self.status_code(),
				http::StatusCode::FORBIDDEN | http::StatusCode::NOT_FOUND
			)
	}

	/// Sanitizes public-facing errors that can leak sensitive information.
	#[must_use]
	pub fn sanitized_message(&self) -> String {
		match self {
			| Self::Database(..) => String::from("Store error occurred."),
			| Self::Io(..) => String::from("I/O error occurred."),
			| _ => self.to_string(),
		}
	}
}

impl std::fmt::Debug for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{self}")
	}
}

#[cfg(test)]
mod tests {
	use super::Error;

	#[test]
	fn classify_forbidden() {
		let e = Error::from_matrix(
			http::StatusCode::FORBIDDEN,
			"M_FORBIDDEN",
			"not allowed",
			None,
		);
		assert!(e.is_forbidden());
		assert!(e.is_permanent());
		assert_eq!(e.errcode(), "M_FORBIDDEN");
	}

	#[test]
	fn classify_by_status_alone() {
		let e = Error::from_matrix(http::StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "gone", None);
		assert!(e.is_not_found());
		assert!(e.is_permanent());
	}

	#[test]
	fn register_conflicts_are_success_equivalent() {
		for errcode in ["M_USER_IN_USE", "M_EXCLUSIVE"] {
			let e =
				Error::from_matrix(http::StatusCode::BAD_REQUEST, errcode, "conflict", None);
			assert!(e.is_register_conflict(), "{errcode}");
			assert!(!e.is_permanent(), "{errcode}");
		}
	}

	#[test]
	fn rate_limit_carries_retry_after() {
		let e = Error::from_matrix(
			http::StatusCode::TOO_MANY_REQUESTS,
			"M_LIMIT_EXCEEDED",
			"slow down",
			Some(1500),
		);
		assert!(matches!(e, Error::RateLimited { retry_after_ms: Some(1500) }));
	}
}
