//! Crate-wide error types and `Result` alias.

// crates.io
use chrono::{DateTime, Utc};

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the remote configuration engine.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Fetch request could not be completed: {0}")]
	Client(String),
	#[error("Value '{value}' cannot be interpreted as {target}.")]
	Coercion { value: String, target: &'static str },
	#[error("The backend returned HTTP {status}.")]
	Server { status: http::StatusCode },
	#[error("The realtime stream failed: {0}")]
	Stream(String),
	#[error("Realtime updates are disabled for this installation.")]
	StreamUnavailable,
	#[error("Fetch requests are throttled until {until}.")]
	Throttled { until: DateTime<Utc> },
	#[error("The latest config template could not be fetched: {0}")]
	UpdateNotFetched(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Whether the error represents a throttled fetch, either from the local
	/// backoff window or a backend rate-limit response.
	pub fn is_throttled(&self) -> bool {
		matches!(self, Self::Throttled { .. })
	}
}
