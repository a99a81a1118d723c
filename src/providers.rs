//! Collaborator seams the engine consumes: host-app identity, installation
//! credentials, and analytics.

// std
use std::{collections::BTreeMap, fmt::Debug};
// crates.io
use async_trait::async_trait;
// self
use crate::_prelude::*;

/// Namespace used when the host application does not configure one.
pub const DEFAULT_NAMESPACE: &str = "firebase";

/// Yields the installation id and auth token attached to fetch and stream
/// requests. Owned by the identity subsystem; the engine only consumes it.
#[async_trait]
pub trait InstallationsProvider: Debug + Send + Sync {
	/// Stable identifier of this app installation.
	async fn installation_id(&self) -> Result<String>;
	/// Short-lived bearer token authenticating this installation.
	async fn installation_token(&self) -> Result<String>;
}

/// Bridge to the host analytics subsystem.
pub trait AnalyticsConnector: Debug + Send + Sync {
	/// User properties included in fetch request bodies.
	fn user_properties(&self) -> BTreeMap<String, String>;
	/// Emit one analytics event.
	fn log_event(&self, origin: &str, name: &str, params: BTreeMap<String, String>);
}

/// Identity of the embedding application, sent with every backend request.
#[derive(Clone, Debug)]
pub struct AppContext {
	/// API key authenticating the project.
	pub api_key: String,
	/// Application identifier within the project.
	pub app_id: String,
	/// Numeric project identifier used in endpoint URLs.
	pub project_number: String,
	/// Parameter namespace; defaults to [`DEFAULT_NAMESPACE`].
	pub namespace: String,
	/// Host package identifier.
	pub package_name: String,
	/// Host signing certificate SHA-1, uppercase hex.
	pub cert_sha1: String,
	/// Host application version.
	pub app_version: String,
	/// Version of this SDK.
	pub sdk_version: String,
	/// Device country code.
	pub country_code: String,
	/// Device language code.
	pub language_code: String,
	/// Host platform version.
	pub platform_version: String,
	/// Device time zone identifier.
	pub time_zone: String,
}
impl AppContext {
	/// Create a context with the required identity fields; the remaining
	/// fields default to empty and can be assigned directly.
	pub fn new(
		api_key: impl Into<String>,
		app_id: impl Into<String>,
		project_number: impl Into<String>,
	) -> Self {
		Self {
			api_key: api_key.into(),
			app_id: app_id.into(),
			project_number: project_number.into(),
			namespace: DEFAULT_NAMESPACE.into(),
			package_name: String::new(),
			cert_sha1: String::new(),
			app_version: String::new(),
			sdk_version: String::new(),
			country_code: String::new(),
			language_code: String::new(),
			platform_version: String::new(),
			time_zone: String::new(),
		}
	}

	/// Validate the context against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		if self.api_key.is_empty() {
			return Err(Error::Validation {
				field: "api_key",
				reason: "Must not be empty.".into(),
			});
		}
		if self.app_id.is_empty() {
			return Err(Error::Validation { field: "app_id", reason: "Must not be empty.".into() });
		}
		if self.project_number.is_empty() {
			return Err(Error::Validation {
				field: "project_number",
				reason: "Must not be empty.".into(),
			});
		}
		if self.namespace.is_empty() {
			return Err(Error::Validation {
				field: "namespace",
				reason: "Must not be empty.".into(),
			});
		}
		if !self.cert_sha1.is_empty()
			&& !self.cert_sha1.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
		{
			return Err(Error::Validation {
				field: "cert_sha1",
				reason: "Must be uppercase hexadecimal.".into(),
			});
		}

		Ok(())
	}
}
