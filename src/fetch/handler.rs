//! Fetch decision algorithm, response classification, and backoff updates.

// crates.io
use chrono::TimeDelta;
use http::StatusCode;
use reqwest::Client;
use url::Url;
// self
use crate::{
	_prelude::*,
	cache::{ConfigCache, DEFAULT_GET_TIMEOUT},
	container::Container,
	fetch::{
		backoff,
		client::{self, BackendResponse, InstallationAuth},
	},
	metrics,
	providers::{AnalyticsConnector, AppContext, InstallationsProvider},
	storage::metadata::MetadataStore,
};

/// How a fetch request was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
	/// The backend returned a new parameter set.
	BackendUpdatesFetched,
	/// The backend confirmed the local template is current.
	BackendHasNoUpdates,
	/// The cached container is fresh enough; no backend call was made.
	LocalStorageUsed,
}

/// Result of a completed fetch.
#[derive(Clone, Debug)]
pub struct FetchResult {
	/// How the request was satisfied.
	pub outcome: FetchOutcome,
	/// The time captured when the fetch decision was made.
	pub fetch_time: DateTime<Utc>,
	/// Fetched container, present for [`FetchOutcome::BackendUpdatesFetched`].
	pub container: Option<Arc<Container>>,
	/// ETag returned by the backend, when one was.
	pub etag: Option<String>,
}

/// Decides when to call the backend, enforces minimum-interval throttling,
/// and maintains the exponential-backoff state machine.
#[derive(Debug)]
pub struct FetchHandler {
	client: Client,
	endpoint: Url,
	context: Arc<AppContext>,
	installations: Arc<dyn InstallationsProvider>,
	analytics: Option<Arc<dyn AnalyticsConnector>>,
	fetched: Arc<ConfigCache>,
	metadata: Arc<MetadataStore>,
}
impl FetchHandler {
	/// Assemble a fetch handler around its collaborators.
	pub fn new(
		client: Client,
		endpoint: Url,
		context: Arc<AppContext>,
		installations: Arc<dyn InstallationsProvider>,
		analytics: Option<Arc<dyn AnalyticsConnector>>,
		fetched: Arc<ConfigCache>,
		metadata: Arc<MetadataStore>,
	) -> Self {
		Self { client, endpoint, context, installations, analytics, fetched, metadata }
	}

	/// Fetch using the configured minimum interval.
	pub async fn fetch(&self) -> Result<FetchResult> {
		self.fetch_with_interval(self.metadata.minimum_fetch_interval()).await
	}

	/// Fetch, consulting the backend only when the cached container is older
	/// than `min_interval` and the backoff window is open.
	#[tracing::instrument(skip(self), fields(namespace = %self.context.namespace))]
	pub async fn fetch_with_interval(&self, min_interval: Duration) -> Result<FetchResult> {
		let result = self.fetch_inner(min_interval).await;

		match &result {
			Ok(result) => self.metadata.record_fetch_success(result.fetch_time),
			Err(err) if err.is_throttled() => self.metadata.record_fetch_throttled(),
			Err(_) => self.metadata.record_fetch_failure(),
		}

		result
	}

	async fn fetch_inner(&self, min_interval: Duration) -> Result<FetchResult> {
		let now = Utc::now();
		let cached = self.fetched.get_with_timeout(DEFAULT_GET_TIMEOUT).await;

		if let Some(cached) = &cached {
			let expires = cached.fetch_time()
				+ TimeDelta::from_std(min_interval).unwrap_or(TimeDelta::MAX);

			if expires > now {
				return Ok(FetchResult {
					outcome: FetchOutcome::LocalStorageUsed,
					fetch_time: now,
					container: None,
					etag: None,
				});
			}
		}

		let backoff_state = self.metadata.fetch_backoff();

		if let Some(until) = backoff_state.backoff_end.filter(|end| now < *end) {
			tracing::debug!(%until, "fetch suppressed by backoff window");
			metrics::record_fetch_throttled();

			return Err(Error::Throttled { until });
		}

		let auth = self.installation_auth().await?;
		let user_properties =
			self.analytics.as_ref().map(|analytics| analytics.user_properties()).unwrap_or_default();
		let custom_signals = self.metadata.custom_signals();
		let response = client::call_fetch_backend(
			&self.client,
			&self.endpoint,
			&self.context,
			&auth,
			self.metadata.last_fetch_etag().as_deref(),
			&user_properties,
			&custom_signals,
			self.metadata.fetch_timeout(),
		)
		.await?;

		self.handle_response(response, now).await
	}

	async fn handle_response(
		&self,
		response: BackendResponse,
		fetch_time: DateTime<Utc>,
	) -> Result<FetchResult> {
		match response.status {
			StatusCode::OK => {
				let body = response.body.unwrap_or_default();
				let result = if body.has_updates() {
					let container = body.into_container(fetch_time);

					self.metadata.set_last_template_version(container.template_version());

					let container = self.fetched.put(container).await?;

					FetchResult {
						outcome: FetchOutcome::BackendUpdatesFetched,
						fetch_time,
						container: Some(container),
						etag: response.etag.clone(),
					}
				} else {
					FetchResult {
						outcome: FetchOutcome::BackendHasNoUpdates,
						fetch_time,
						container: None,
						etag: response.etag.clone(),
					}
				};

				self.metadata.reset_fetch_backoff();

				if let Some(etag) = &response.etag {
					self.metadata.set_last_fetch_etag(etag);
				}

				metrics::record_fetch_success(response.elapsed, result.outcome);

				Ok(result)
			},
			// Conditional revalidation matched the stored ETag.
			StatusCode::NOT_MODIFIED => {
				self.metadata.reset_fetch_backoff();

				if let Some(etag) = &response.etag {
					self.metadata.set_last_fetch_etag(etag);
				}

				metrics::record_fetch_success(response.elapsed, FetchOutcome::BackendHasNoUpdates);

				Ok(FetchResult {
					outcome: FetchOutcome::BackendHasNoUpdates,
					fetch_time,
					container: None,
					etag: response.etag,
				})
			},
			StatusCode::TOO_MANY_REQUESTS => {
				let (_, until) = self.advance_backoff();

				metrics::record_fetch_throttled();

				Err(Error::Throttled { until })
			},
			status @ (StatusCode::BAD_GATEWAY
			| StatusCode::SERVICE_UNAVAILABLE
			| StatusCode::GATEWAY_TIMEOUT) => {
				let (num_failures, until) = self.advance_backoff();

				// A single edge error is surfaced as-is; only the second
				// consecutive failure closes the window on the caller.
				if num_failures > 1 {
					metrics::record_fetch_throttled();

					Err(Error::Throttled { until })
				} else {
					metrics::record_fetch_error(status);

					Err(Error::Server { status })
				}
			},
			status => {
				metrics::record_fetch_error(status);

				Err(Error::Server { status })
			},
		}
	}

	async fn installation_auth(&self) -> Result<InstallationAuth> {
		let (id, token) =
			tokio::try_join!(self.installations.installation_id(), self.installations.installation_token())
				.map_err(|err| {
					Error::Client(format!("installation credentials unavailable: {err}"))
				})?;

		Ok(InstallationAuth { id, token })
	}

	fn advance_backoff(&self) -> (u32, DateTime<Utc>) {
		let failure_time = Utc::now();
		let updated = backoff::advance(self.metadata.fetch_backoff(), failure_time);

		self.metadata.set_fetch_backoff(updated);

		(updated.num_failures, updated.backoff_end.unwrap_or(failure_time))
	}
}
