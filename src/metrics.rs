//! Metrics helpers for fetch and stream telemetry.

// crates.io
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
// self
#[cfg(feature = "prometheus")] use crate::_prelude::*;
use crate::fetch::handler::FetchOutcome;

#[cfg(feature = "metrics")]
type LabelSet = smallvec::SmallVec<[metrics::Label; 4]>;

#[cfg(feature = "metrics")]
const METRIC_FETCH_TOTAL: &str = "remote_config_fetch_total";
#[cfg(feature = "metrics")]
const METRIC_FETCH_DURATION: &str = "remote_config_fetch_duration_seconds";
#[cfg(feature = "metrics")]
const METRIC_FETCH_ERRORS: &str = "remote_config_fetch_errors_total";
#[cfg(feature = "metrics")]
const METRIC_FETCH_THROTTLED: &str = "remote_config_fetch_throttled_total";
#[cfg(feature = "metrics")]
const METRIC_STREAM_CONNECTS: &str = "remote_config_stream_connects_total";
#[cfg(feature = "metrics")]
const METRIC_STREAM_RETRIES: &str = "remote_config_stream_retries_total";
#[cfg(feature = "metrics")]
const METRIC_AUTOFETCH_ATTEMPTS: &str = "remote_config_autofetch_attempts_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

/// Install a process-wide Prometheus recorder and retain its handle.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Client(format!("failed to install metrics recorder: {err}")))?;

	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Render the current metric registry in Prometheus exposition format.
#[cfg(feature = "prometheus")]
pub fn render() -> Option<String> {
	PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

/// Record a successful fetch exchange and its duration.
pub fn record_fetch_success(elapsed: std::time::Duration, outcome: FetchOutcome) {
	#[cfg(feature = "metrics")]
	{
		let outcome = match outcome {
			FetchOutcome::BackendUpdatesFetched => "updates_fetched",
			FetchOutcome::BackendHasNoUpdates => "no_updates",
			FetchOutcome::LocalStorageUsed => "local_storage",
		};
		let labels: LabelSet = [metrics::Label::new("outcome", outcome)].into_iter().collect();

		metrics::counter!(METRIC_FETCH_TOTAL, labels.to_vec()).increment(1);
		metrics::histogram!(METRIC_FETCH_DURATION).record(elapsed.as_secs_f64());
	}
	#[cfg(not(feature = "metrics"))]
	let _ = (elapsed, outcome);
}

/// Record a fetch rejected by the backend.
pub fn record_fetch_error(status: http::StatusCode) {
	#[cfg(feature = "metrics")]
	{
		let labels: LabelSet =
			[metrics::Label::new("status", status.as_u16().to_string())].into_iter().collect();

		metrics::counter!(METRIC_FETCH_ERRORS, labels.to_vec()).increment(1);
	}
	#[cfg(not(feature = "metrics"))]
	let _ = status;
}

/// Record a throttled fetch, local or backend-initiated.
pub fn record_fetch_throttled() {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_FETCH_THROTTLED).increment(1);
}

/// Record a successfully opened realtime stream.
pub fn record_stream_connect() {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_STREAM_CONNECTS).increment(1);
}

/// Record a stream attempt that will retry after backoff.
pub fn record_stream_retry() {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_STREAM_RETRIES).increment(1);
}

/// Record one autofetch backend consultation.
pub fn record_autofetch_attempt() {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_AUTOFETCH_ATTEMPTS).increment(1);
}
