//! Shared fixtures for the integration suite.

// std
use std::{path::Path, sync::Arc};
// crates.io
use async_trait::async_trait;
use remote_config::{
	AppContext, ConfigEngine, ConfigUpdate, ConfigUpdateListener, Error, InstallationsProvider,
	Result,
};
use tokio::sync::mpsc;
use url::Url;
use wiremock::MockServer;

/// Initialize test logging once per process.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt::try_init();
}

#[derive(Debug)]
pub struct StubInstallations;
#[async_trait]
impl InstallationsProvider for StubInstallations {
	async fn installation_id(&self) -> Result<String> {
		Ok("installation-id".into())
	}

	async fn installation_token(&self) -> Result<String> {
		Ok("installation-token".into())
	}
}

/// Update listener forwarding callbacks onto channels.
pub struct ChannelListener {
	pub updates: mpsc::UnboundedSender<ConfigUpdate>,
	pub errors: mpsc::UnboundedSender<String>,
}
impl ChannelListener {
	pub fn channels() -> (
		Arc<Self>,
		mpsc::UnboundedReceiver<ConfigUpdate>,
		mpsc::UnboundedReceiver<String>,
	) {
		let (updates, update_rx) = mpsc::unbounded_channel();
		let (errors, error_rx) = mpsc::unbounded_channel();

		(Arc::new(Self { updates, errors }), update_rx, error_rx)
	}
}
impl ConfigUpdateListener for ChannelListener {
	fn on_update(&self, update: ConfigUpdate) {
		let _ = self.updates.send(update);
	}

	fn on_error(&self, error: &Error) {
		let _ = self.errors.send(error.to_string());
	}
}

/// Build an engine whose endpoints point at the mock server.
pub fn engine_for(server: &MockServer, dir: &Path) -> ConfigEngine {
	let base = Url::parse(&server.uri()).expect("mock server uri");

	ConfigEngine::builder(dir, AppContext::new("key", "app", "42"))
		.installations(Arc::new(StubInstallations))
		.base_url(base)
		.build()
		.expect("engine")
}

/// Path of the fetch operation for the test context.
pub const FETCH_PATH: &str = "/v1/projects/42/namespaces/firebase:fetch";
/// Path of the stream operation for the test context.
pub const STREAM_PATH: &str = "/v1/projects/42/namespaces/firebase:streamFetchInvalidations";
