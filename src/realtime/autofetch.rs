//! Version-target-chasing fetch retry with randomized delay.

// self
use crate::{
	_prelude::*,
	cache::ConfigCache,
	container::Container,
	diff::changed_params,
	fetch::{
		backoff,
		handler::{FetchHandler, FetchOutcome},
	},
	metrics,
	realtime::controller::{ConfigUpdate, ListenerSet},
};

/// Attempt budget granted per stream announcement.
pub const MAX_ATTEMPTS: u32 = 3;

/// Upper bound (exclusive) of the randomized pre-fetch delay, in whole
/// seconds. The jitter avoids synchronized fetch bursts across clients on
/// large rollouts.
const MAX_DELAY_SECS: u64 = 4;

/// Chases an announced template version by repeatedly forcing backend
/// fetches until the fetched version reaches the target or the attempt
/// budget runs out.
#[derive(Debug)]
pub struct AutoFetcher {
	fetch: Arc<FetchHandler>,
	activated: Arc<ConfigCache>,
	fetched: Arc<ConfigCache>,
	listeners: Arc<ListenerSet>,
}
impl AutoFetcher {
	/// Assemble an autofetch controller.
	pub fn new(
		fetch: Arc<FetchHandler>,
		activated: Arc<ConfigCache>,
		fetched: Arc<ConfigCache>,
		listeners: Arc<ListenerSet>,
	) -> Self {
		Self { fetch, activated, fetched, listeners }
	}

	/// Fetch until the backend serves `target_version`, spending at most
	/// `remaining` backend calls, then notify every registered listener.
	#[tracing::instrument(skip(self))]
	pub async fn auto_fetch(&self, mut remaining: u32, target_version: u64) {
		loop {
			// A delay that fires after the last listener is gone no-ops.
			if self.listeners.is_empty() {
				return;
			}
			if remaining == 0 {
				self.listeners.notify_error(&Error::UpdateNotFetched(format!(
					"template version {target_version} was not reached within the attempt budget"
				)));

				return;
			}

			let delay = backoff::random_delay_secs(MAX_DELAY_SECS);

			tokio::time::sleep(Duration::from_secs(delay)).await;

			let attempt = MAX_ATTEMPTS - (remaining - 1);

			tracing::debug!(attempt, "autofetch consulting the backend");
			metrics::record_autofetch_attempt();

			match self.fetch.fetch_with_interval(Duration::ZERO).await {
				Ok(result) => {
					let effective = match (&result.container, result.outcome) {
						(Some(container), _) => container.template_version(),
						// The backend has confirmed there is nothing newer.
						(None, FetchOutcome::BackendHasNoUpdates) => target_version,
						_ => 0,
					};

					if effective >= target_version {
						let update = self.compute_update(result.container).await;

						self.listeners.notify_update(&update);

						return;
					}

					remaining -= 1;
				},
				Err(err) => {
					tracing::warn!(error = %err, "autofetch attempt failed");
					self.listeners.notify_error(&Error::UpdateNotFetched(format!(
						"fetch failed while chasing template version {target_version}: {err}"
					)));

					return;
				},
			}
		}
	}

	async fn compute_update(&self, fetched: Option<Arc<Container>>) -> ConfigUpdate {
		let fetched = match fetched {
			Some(container) => Some(container),
			None => self.fetched.get().await,
		};
		let activated = self.activated.get().await;
		let empty = Container::builder().build();
		let updated_keys = changed_params(
			activated.as_deref().unwrap_or(&empty),
			fetched.as_deref().unwrap_or(&empty),
		);

		ConfigUpdate { updated_keys }
	}
}
