//! Long-lived invalidation stream: connect, framed-message read loop, and
//! reconnect backoff.

// std
use std::sync::atomic::{AtomicBool, Ordering};
// crates.io
use http::{
	StatusCode,
	header::{ACCEPT, CONTENT_TYPE},
};
use reqwest::{Client, Response};
use serde_json::{Map, Value};
use url::Url;
// self
use crate::{
	_prelude::*,
	fetch::{
		backoff,
		client::{HEADER_API_KEY, HEADER_CERT, HEADER_INSTALLATIONS_AUTH, HEADER_PACKAGE},
	},
	metrics,
	providers::{AppContext, InstallationsProvider},
	realtime::{
		autofetch::{AutoFetcher, MAX_ATTEMPTS},
		controller::ListenerSet,
	},
	storage::metadata::MetadataStore,
};

/// Opt-in header for a chunked streaming response.
pub const HEADER_RESPONSE_STREAMING: &str = "X-Accept-Response-Streaming";

const RETRYABLE_STATUS: [StatusCode; 5] = [
	StatusCode::REQUEST_TIMEOUT,
	StatusCode::TOO_MANY_REQUESTS,
	StatusCode::BAD_GATEWAY,
	StatusCode::SERVICE_UNAVAILABLE,
	StatusCode::GATEWAY_TIMEOUT,
];

/// Outcome of one connection attempt.
enum Attempt {
	/// Schedule another connect after a backoff window.
	Retry,
	/// Stop streaming; no reconnect.
	Halt,
}

/// One background stream task. The controller spawns at most one at a time;
/// cancellation happens at any await point when the controller aborts the
/// task, which also drops and thereby closes the HTTP connection.
pub(crate) struct StreamTask {
	client: Client,
	endpoint: Url,
	context: Arc<AppContext>,
	installations: Arc<dyn InstallationsProvider>,
	metadata: Arc<MetadataStore>,
	listeners: Arc<ListenerSet>,
	autofetch: Arc<AutoFetcher>,
	disabled: Arc<AtomicBool>,
}
impl StreamTask {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		client: Client,
		endpoint: Url,
		context: Arc<AppContext>,
		installations: Arc<dyn InstallationsProvider>,
		metadata: Arc<MetadataStore>,
		listeners: Arc<ListenerSet>,
		autofetch: Arc<AutoFetcher>,
		disabled: Arc<AtomicBool>,
	) -> Self {
		Self { client, endpoint, context, installations, metadata, listeners, autofetch, disabled }
	}

	pub(crate) async fn run(self) {
		loop {
			if self.disabled.load(Ordering::Acquire) || self.listeners.is_empty() {
				return;
			}

			let now = Utc::now();
			let backoff_state = self.metadata.realtime_backoff();

			if let Some(until) = backoff_state.backoff_end.filter(|end| now < *end) {
				let wait = (until - now).to_std().unwrap_or_default();

				tracing::debug!(?wait, "realtime stream waiting out backoff window");
				tokio::time::sleep(wait).await;

				continue;
			}

			match self.connect_and_read().await {
				Attempt::Retry => {
					let updated = backoff::advance(self.metadata.realtime_backoff(), Utc::now());

					self.metadata.set_realtime_backoff(updated);
					metrics::record_stream_retry();
				},
				Attempt::Halt => return,
			}
		}
	}

	async fn connect_and_read(&self) -> Attempt {
		let token = match self.installations.installation_token().await {
			Ok(token) => token,
			Err(err) => {
				tracing::warn!(error = %err, "stream auth token unavailable; retrying");

				return Attempt::Retry;
			},
		};
		let body = serde_json::json!({
			"project": self.context.project_number,
			"namespace": self.context.namespace,
			"lastKnownVersionNumber": self.metadata.last_template_version(),
			"appId": self.context.app_id,
			"sdkVersion": self.context.sdk_version,
		});
		let request = self
			.client
			.post(self.endpoint.clone())
			.header(CONTENT_TYPE, "application/json")
			.header(ACCEPT, "application/json")
			.header(HEADER_API_KEY, &self.context.api_key)
			.header(HEADER_INSTALLATIONS_AUTH, &token)
			.header(HEADER_PACKAGE, &self.context.package_name)
			.header(HEADER_CERT, &self.context.cert_sha1)
			.header(HEADER_RESPONSE_STREAMING, "true")
			.json(&body);
		let response = match request.send().await {
			Ok(response) => response,
			Err(err) => {
				tracing::warn!(error = %err, "stream connection failed; retrying");

				return Attempt::Retry;
			},
		};
		let status = response.status();

		if status == StatusCode::OK {
			tracing::debug!("realtime stream open");
			self.metadata.reset_realtime_backoff();
			metrics::record_stream_connect();

			self.read_messages(response).await
		} else if RETRYABLE_STATUS.contains(&status) {
			tracing::debug!(%status, "stream rejected with retryable status");

			Attempt::Retry
		} else {
			self.listeners.notify_error(&Error::Stream(format!(
				"stream rejected with HTTP {status}"
			)));

			Attempt::Halt
		}
	}

	async fn read_messages(&self, mut response: Response) -> Attempt {
		let mut pending = String::new();
		let mut accumulator = String::new();

		loop {
			let chunk = match response.chunk().await {
				Ok(Some(chunk)) => chunk,
				Ok(None) => {
					tracing::debug!("stream closed by server; retrying");

					return Attempt::Retry;
				},
				Err(err) => {
					tracing::warn!(error = %err, "stream read failed; retrying");

					return Attempt::Retry;
				},
			};

			pending.push_str(&String::from_utf8_lossy(&chunk));

			while let Some(newline) = pending.find('\n') {
				let line: String = pending.drain(..=newline).collect();

				if let Some(message) = accumulate_line(&mut accumulator, line.trim_end()) {
					match self.handle_message(&message) {
						MessageOutcome::Continue => {},
						MessageOutcome::Disabled => {
							self.disabled.store(true, Ordering::Release);
							self.listeners.notify_error(&Error::StreamUnavailable);

							return Attempt::Halt;
						},
					}
				}
			}
		}
	}

	fn handle_message(&self, message: &Map<String, Value>) -> MessageOutcome {
		if message.get("featureDisabled").and_then(Value::as_bool) == Some(true) {
			tracing::warn!("backend disabled realtime updates for this installation");

			return MessageOutcome::Disabled;
		}
		if let Some(version) = message.get("latestTemplateVersionNumber").and_then(Value::as_u64) {
			let known = self.metadata.last_template_version();

			if version > known {
				tracing::debug!(version, known, "newer template announced; scheduling autofetch");

				let autofetch = self.autofetch.clone();

				tokio::spawn(async move { autofetch.auto_fetch(MAX_ATTEMPTS, version).await });
			}
		}

		MessageOutcome::Continue
	}
}

enum MessageOutcome {
	Continue,
	Disabled,
}

/// Append one line to the accumulator and try to frame a message.
///
/// A message is attempted once an accumulated line contains `}`: the
/// substring from the first `{` to the last `}` is parsed as a single JSON
/// object. Both a parsed message and a parse failure clear the accumulator;
/// an empty extraction is a no-op. Multiple objects coalesced into one frame
/// are intentionally parsed as just the outermost envelope.
fn accumulate_line(accumulator: &mut String, line: &str) -> Option<Map<String, Value>> {
	accumulator.push_str(line);

	if !line.contains('}') {
		return None;
	}

	let extracted = {
		let start = accumulator.find('{')?;
		let end = accumulator.rfind('}')?;

		if start > end {
			return None;
		}

		accumulator[start..=end].to_string()
	};

	match serde_json::from_str::<Map<String, Value>>(&extracted) {
		Ok(message) => {
			accumulator.clear();

			Some(message)
		},
		Err(err) => {
			tracing::warn!(error = %err, "unparseable stream message discarded");
			accumulator.clear();

			None
		},
	}
}
