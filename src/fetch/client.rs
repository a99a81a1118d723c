//! Wire types and the HTTP call behind a single fetch attempt.

// std
use std::collections::BTreeMap;
// crates.io
use http::{
	StatusCode,
	header::{ACCEPT, CONTENT_TYPE, ETAG, IF_NONE_MATCH},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{
	_prelude::*,
	container::{Container, ExperimentDescriptor, PersonalizationMetadata},
	providers::AppContext,
};

/// Project API key header.
pub const HEADER_API_KEY: &str = "X-Goog-Api-Key";
/// Installation auth token header.
pub const HEADER_INSTALLATIONS_AUTH: &str = "X-Goog-Firebase-Installations-Auth";
/// Host package identifier header.
pub const HEADER_PACKAGE: &str = "X-Android-Package";
/// Host signing certificate header.
pub const HEADER_CERT: &str = "X-Android-Cert";
/// Opt-in for edge-level retries.
pub const HEADER_GFE_CAN_RETRY: &str = "X-Google-GFE-Can-Retry";

const STATE_NO_CHANGE: &str = "NO_CHANGE";

/// Installation credentials attached to one request.
#[derive(Clone, Debug)]
pub struct InstallationAuth {
	/// Stable installation identifier.
	pub id: String,
	/// Bearer token for this installation.
	pub token: String,
}

/// JSON body of a fetch request.
#[derive(Debug, Serialize)]
pub struct FetchRequestBody<'a> {
	app_instance_id: &'a str,
	app_instance_id_token: &'a str,
	app_id: &'a str,
	country_code: &'a str,
	language_code: &'a str,
	platform_version: &'a str,
	time_zone: &'a str,
	app_version: &'a str,
	package_name: &'a str,
	sdk_version: &'a str,
	analytics_user_properties: &'a BTreeMap<String, String>,
	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	custom_signals: &'a BTreeMap<String, String>,
}

/// JSON body of a fetch response.
#[derive(Debug, Default, Deserialize)]
pub struct FetchResponseBody {
	#[serde(default)]
	state: Option<String>,
	#[serde(default)]
	entries: Option<BTreeMap<String, String>>,
	#[serde(rename = "experimentDescriptions", default)]
	experiment_descriptions: Vec<ExperimentDescriptor>,
	#[serde(rename = "personalizationMetadata", default)]
	personalization_metadata: BTreeMap<String, PersonalizationMetadata>,
	#[serde(rename = "templateVersion", default)]
	template_version: u64,
}
impl FetchResponseBody {
	/// Whether the response carries a new parameter set. A `NO_CHANGE` state
	/// or a missing `entries` map both mean the backend has nothing newer.
	pub fn has_updates(&self) -> bool {
		self.state.as_deref() != Some(STATE_NO_CHANGE) && self.entries.is_some()
	}

	/// Build the fetched container, stamping it with `fetch_time`.
	pub fn into_container(self, fetch_time: DateTime<Utc>) -> Container {
		Container::builder()
			.configs(self.entries.unwrap_or_default())
			.fetch_time(fetch_time)
			.experiments(self.experiment_descriptions)
			.personalization(self.personalization_metadata)
			.template_version(self.template_version)
			.build()
	}
}

/// Outcome of one HTTP exchange with the fetch endpoint.
#[derive(Debug)]
pub struct BackendResponse {
	/// HTTP status returned by the backend.
	pub status: StatusCode,
	/// ETag advertised for the returned template, when present.
	pub etag: Option<String>,
	/// Parsed body; present only for HTTP 200.
	pub body: Option<FetchResponseBody>,
	/// Round-trip duration of the exchange.
	pub elapsed: Duration,
}

/// Endpoint URL for the fetch operation.
pub fn fetch_url(base: &Url, context: &AppContext) -> Result<Url> {
	versioned_url(base, context, "fetch")
}

/// Endpoint URL for the realtime invalidation stream.
pub fn stream_url(base: &Url, context: &AppContext) -> Result<Url> {
	versioned_url(base, context, "streamFetchInvalidations")
}

fn versioned_url(base: &Url, context: &AppContext, operation: &str) -> Result<Url> {
	Ok(base.join(&format!(
		"v1/projects/{}/namespaces/{}:{operation}",
		context.project_number, context.namespace
	))?)
}

/// Execute one fetch exchange. Transport failures and unparseable success
/// bodies surface as [`Error::Client`]; non-2xx statuses are returned to the
/// caller for classification.
#[allow(clippy::too_many_arguments)]
pub async fn call_fetch_backend(
	client: &Client,
	url: &Url,
	context: &AppContext,
	auth: &InstallationAuth,
	last_etag: Option<&str>,
	user_properties: &BTreeMap<String, String>,
	custom_signals: &BTreeMap<String, String>,
	timeout: Duration,
) -> Result<BackendResponse> {
	let body = FetchRequestBody {
		app_instance_id: &auth.id,
		app_instance_id_token: &auth.token,
		app_id: &context.app_id,
		country_code: &context.country_code,
		language_code: &context.language_code,
		platform_version: &context.platform_version,
		time_zone: &context.time_zone,
		app_version: &context.app_version,
		package_name: &context.package_name,
		sdk_version: &context.sdk_version,
		analytics_user_properties: user_properties,
		custom_signals,
	};
	let mut request = client
		.post(url.clone())
		.timeout(timeout)
		.header(CONTENT_TYPE, "application/json")
		.header(ACCEPT, "application/json")
		.header(HEADER_API_KEY, &context.api_key)
		.header(HEADER_INSTALLATIONS_AUTH, &auth.token)
		.header(HEADER_PACKAGE, &context.package_name)
		.header(HEADER_CERT, &context.cert_sha1)
		.header(HEADER_GFE_CAN_RETRY, "yes")
		.json(&body);

	if let Some(etag) = last_etag {
		request = request.header(IF_NONE_MATCH, etag);
	}

	let start = Instant::now();
	let response = request
		.send()
		.await
		.map_err(|err| Error::Client(format!("fetch request failed: {err}")))?;
	let elapsed = start.elapsed();
	let status = response.status();
	let etag = response
		.headers()
		.get(ETAG)
		.and_then(|value| value.to_str().ok())
		.map(|etag| etag.to_string());

	tracing::debug!(%status, ?elapsed, "fetch exchange complete");

	let body = if status == StatusCode::OK {
		let payload = response
			.json::<FetchResponseBody>()
			.await
			.map_err(|err| Error::Client(format!("fetch response unparseable: {err}")))?;

		Some(payload)
	} else {
		None
	};

	Ok(BackendResponse { status, etag, body, elapsed })
}
