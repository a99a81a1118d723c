//! Engine assembly: slot interning, the public API surface, and activation.

// std
use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	path::PathBuf,
	sync::Mutex,
};
// crates.io
use reqwest::Client;
use url::Url;
// self
use crate::{
	_prelude::*,
	cache::{ConfigCache, DEFAULT_GET_TIMEOUT},
	container::Container,
	diff::changed_params,
	fetch::{
		client as fetch_client,
		handler::{FetchHandler, FetchResult},
	},
	providers::{AnalyticsConnector, AppContext, InstallationsProvider},
	realtime::{
		autofetch::AutoFetcher,
		controller::{ConfigUpdateListener, ListenerHandle, ListenerSet, StreamController},
	},
	resolver::{ConfigValue, ParamResolver},
	rollouts::{PersonalizationLogger, RolloutsHandler, RolloutsStateSubscriber},
	storage::{
		file::FileStorage,
		metadata::{ConfigSettings, FetchStatus, MetadataStore},
	},
};

/// Production endpoint base.
pub const DEFAULT_BASE_URL: &str = "https://firebaseremoteconfig.googleapis.com/";

const ACTIVATE_FILE: &str = "activate.json";
const FETCH_FILE: &str = "fetch.json";
const DEFAULTS_FILE: &str = "defaults.json";
const SETTINGS_FILE: &str = "settings.json";

/// Interns one storage/cache handle per file name, scoped to the owning
/// engine. Two slots resolving the same name share the same handle, which
/// keeps a single writer per file.
#[derive(Debug)]
pub struct SlotRegistry {
	dir: PathBuf,
	slots: Mutex<HashMap<String, Arc<ConfigCache>>>,
}
impl SlotRegistry {
	/// Create a registry rooted at `dir`.
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into(), slots: Mutex::new(HashMap::new()) }
	}

	/// The interned cache handle for `file_name`, creating it on first use.
	pub fn cache(&self, file_name: &str) -> Arc<ConfigCache> {
		let mut slots = self.slots.lock().expect("slot lock poisoned");

		slots
			.entry(file_name.to_string())
			.or_insert_with(|| {
				Arc::new(ConfigCache::new(Arc::new(FileStorage::new(&self.dir, file_name))))
			})
			.clone()
	}
}

/// Builder for [`ConfigEngine`].
#[derive(Debug)]
pub struct EngineBuilder {
	config_dir: PathBuf,
	context: AppContext,
	installations: Option<Arc<dyn InstallationsProvider>>,
	analytics: Option<Arc<dyn AnalyticsConnector>>,
	base_url: Option<Url>,
	fetch_endpoint: Option<Url>,
	stream_endpoint: Option<Url>,
	client: Option<Client>,
}
impl EngineBuilder {
	/// Start building an engine persisting under `config_dir`.
	pub fn new(config_dir: impl Into<PathBuf>, context: AppContext) -> Self {
		Self {
			config_dir: config_dir.into(),
			context,
			installations: None,
			analytics: None,
			base_url: None,
			fetch_endpoint: None,
			stream_endpoint: None,
			client: None,
		}
	}

	/// Supply the installation-credentials provider (required).
	pub fn installations(mut self, installations: Arc<dyn InstallationsProvider>) -> Self {
		self.installations = Some(installations);

		self
	}

	/// Supply the analytics connector enabling user properties and
	/// personalization logging.
	pub fn analytics(mut self, analytics: Arc<dyn AnalyticsConnector>) -> Self {
		self.analytics = Some(analytics);

		self
	}

	/// Override the endpoint base URL.
	pub fn base_url(mut self, base_url: Url) -> Self {
		self.base_url = Some(base_url);

		self
	}

	/// Override the fetch endpoint URL directly.
	pub fn fetch_endpoint(mut self, endpoint: Url) -> Self {
		self.fetch_endpoint = Some(endpoint);

		self
	}

	/// Override the realtime stream endpoint URL directly.
	pub fn stream_endpoint(mut self, endpoint: Url) -> Self {
		self.stream_endpoint = Some(endpoint);

		self
	}

	/// Use the supplied HTTP client instead of the built-in one.
	pub fn http_client(mut self, client: Client) -> Self {
		self.client = Some(client);

		self
	}

	/// Finalize the configuration and assemble a [`ConfigEngine`].
	pub fn build(self) -> Result<ConfigEngine> {
		self.context.validate()?;

		let installations = self.installations.ok_or(Error::Validation {
			field: "installations",
			reason: "An installations provider is required.".into(),
		})?;
		let client = match self.client {
			Some(client) => client,
			None => Client::builder()
				.user_agent(format!("remote-config/{}", env!("CARGO_PKG_VERSION")))
				.connect_timeout(Duration::from_secs(5))
				.build()?,
		};
		let context = Arc::new(self.context);
		let base_url = match self.base_url {
			Some(base_url) => base_url,
			None => Url::parse(DEFAULT_BASE_URL)?,
		};
		let fetch_endpoint = match self.fetch_endpoint {
			Some(endpoint) => endpoint,
			None => fetch_client::fetch_url(&base_url, &context)?,
		};
		let stream_endpoint = match self.stream_endpoint {
			Some(endpoint) => endpoint,
			None => fetch_client::stream_url(&base_url, &context)?,
		};
		let registry = SlotRegistry::new(&self.config_dir);
		let activated = registry.cache(&slot_file(&context, ACTIVATE_FILE));
		let fetched = registry.cache(&slot_file(&context, FETCH_FILE));
		let defaults = registry.cache(&slot_file(&context, DEFAULTS_FILE));
		let metadata =
			Arc::new(MetadataStore::open(&self.config_dir, &slot_file(&context, SETTINGS_FILE)));
		let fetch = Arc::new(FetchHandler::new(
			client.clone(),
			fetch_endpoint,
			context.clone(),
			installations.clone(),
			self.analytics.clone(),
			fetched.clone(),
			metadata.clone(),
		));
		let resolver = Arc::new(ParamResolver::new(activated.clone(), defaults.clone()));
		let rollouts = Arc::new(RolloutsHandler::new(activated.clone()));
		let listeners = Arc::new(ListenerSet::default());
		let autofetch = Arc::new(AutoFetcher::new(
			fetch.clone(),
			activated.clone(),
			fetched.clone(),
			listeners.clone(),
		));
		let stream = StreamController::new(
			client,
			stream_endpoint,
			context.clone(),
			installations,
			metadata.clone(),
			autofetch,
			listeners,
		);

		if let Some(analytics) = self.analytics {
			let personalization = Arc::new(PersonalizationLogger::new(analytics));

			resolver.add_listener(Arc::new(move |key: &str, container: &Arc<Container>| {
				personalization.log_assignment(key, container);
			}));
		}

		Ok(ConfigEngine {
			registry,
			activated,
			fetched,
			defaults,
			metadata,
			fetch,
			resolver,
			rollouts,
			stream,
		})
	}
}

/// The client-side remote configuration engine.
///
/// Owns the three cache slots, the persisted metadata, the fetch handler,
/// the parameter resolver, and the realtime stream controller. All work is
/// driven by calls on this type plus the single background stream task alive
/// while update listeners are registered.
#[derive(Debug)]
pub struct ConfigEngine {
	#[allow(dead_code)]
	registry: SlotRegistry,
	activated: Arc<ConfigCache>,
	fetched: Arc<ConfigCache>,
	defaults: Arc<ConfigCache>,
	metadata: Arc<MetadataStore>,
	fetch: Arc<FetchHandler>,
	resolver: Arc<ParamResolver>,
	rollouts: Arc<RolloutsHandler>,
	stream: StreamController,
}
impl ConfigEngine {
	/// Start building an engine.
	pub fn builder(config_dir: impl Into<PathBuf>, context: AppContext) -> EngineBuilder {
		EngineBuilder::new(config_dir, context)
	}

	/// Fetch using the configured minimum interval.
	pub async fn fetch(&self) -> Result<FetchResult> {
		self.fetch.fetch().await
	}

	/// Fetch with an explicit minimum interval; zero forces a backend
	/// consultation (still subject to the backoff window).
	pub async fn fetch_with_interval(&self, min_interval: Duration) -> Result<FetchResult> {
		self.fetch.fetch_with_interval(min_interval).await
	}

	/// Make the most recently fetched container visible to lookups.
	///
	/// Returns `false` when there is nothing fetched or the fetched snapshot
	/// is not newer than the activated one. On success the fetched slot is
	/// cleared and subscribers receive the activation diff.
	#[tracing::instrument(skip(self))]
	pub async fn activate(&self) -> Result<bool> {
		let Some(fetched) = self.fetched.get_with_timeout(DEFAULT_GET_TIMEOUT).await else {
			return Ok(false);
		};
		let activated = self.activated.get_with_timeout(DEFAULT_GET_TIMEOUT).await;

		if let Some(activated) = &activated
			&& fetched.fetch_time() <= activated.fetch_time()
		{
			tracing::debug!("fetched container is not newer; skipping activation");

			return Ok(false);
		}

		let empty = Container::builder().build();
		let changed = changed_params(activated.as_deref().unwrap_or(&empty), &fetched);
		let stored = self.activated.put((*fetched).clone()).await?;

		self.fetched.clear().await?;

		tracing::debug!(changed = changed.len(), "activated fetched container");
		self.rollouts.publish_activation(stored, changed);

		Ok(true)
	}

	/// Fetch and, when the backend produced updates, activate them.
	pub async fn fetch_and_activate(&self) -> Result<bool> {
		self.fetch().await?;

		self.activate().await
	}

	/// Replace the developer-supplied defaults container.
	pub async fn set_defaults(&self, defaults: BTreeMap<String, String>) -> Result<()> {
		self.defaults.put(Container::builder().configs(defaults).build()).await?;

		Ok(())
	}

	/// String value for `key`.
	pub async fn get_string(&self, key: &str) -> String {
		self.resolver.get_string(key).await
	}

	/// Boolean value for `key`.
	pub async fn get_bool(&self, key: &str) -> bool {
		self.resolver.get_bool(key).await
	}

	/// Long value for `key`.
	pub async fn get_long(&self, key: &str) -> i64 {
		self.resolver.get_long(key).await
	}

	/// Double value for `key`.
	pub async fn get_double(&self, key: &str) -> f64 {
		self.resolver.get_double(key).await
	}

	/// UTF-8 bytes for `key`.
	pub async fn get_byte_array(&self, key: &str) -> Vec<u8> {
		self.resolver.get_byte_array(key).await
	}

	/// Source-tagged value for `key`.
	pub async fn get_value(&self, key: &str) -> ConfigValue {
		self.resolver.get_value(key).await
	}

	/// Ordered keys starting with `prefix` across activated and defaults.
	pub async fn get_keys_by_prefix(&self, prefix: &str) -> BTreeSet<String> {
		self.resolver.get_keys_by_prefix(prefix).await
	}

	/// Every known key resolved to a source-tagged value.
	pub async fn get_all(&self) -> BTreeMap<String, ConfigValue> {
		self.resolver.get_all().await
	}

	/// Register a realtime update listener; the first registration opens the
	/// stream.
	pub fn add_update_listener(&self, listener: Arc<dyn ConfigUpdateListener>) -> ListenerHandle {
		self.stream.add_listener(listener)
	}

	/// Whether the background stream task is currently alive.
	pub fn is_streaming(&self) -> bool {
		self.stream.is_streaming()
	}

	/// Register a rollouts-state subscriber.
	pub async fn add_rollouts_subscriber(&self, subscriber: Arc<dyn RolloutsStateSubscriber>) {
		self.rollouts.add_subscriber(subscriber).await
	}

	/// Merge a custom-signals update; returns whether anything was persisted.
	pub fn set_custom_signals(&self, updates: BTreeMap<String, Option<String>>) -> bool {
		self.metadata.update_custom_signals(updates)
	}

	/// Current developer-configurable settings.
	pub fn config_settings(&self) -> ConfigSettings {
		self.metadata.config_settings()
	}

	/// Replace the developer-configurable settings.
	pub fn set_config_settings(&self, settings: ConfigSettings) {
		self.metadata.set_config_settings(&settings);
	}

	/// Outcome of the most recent fetch attempt.
	pub fn last_fetch_status(&self) -> FetchStatus {
		self.metadata.last_fetch_status()
	}

	/// Time of the most recent successful fetch, when one has happened.
	pub fn last_successful_fetch_time(&self) -> Option<DateTime<Utc>> {
		self.metadata.last_successful_fetch_time()
	}

	/// Drop every cached container and persisted metadata value.
	pub async fn reset(&self) -> Result<()> {
		self.activated.clear().await?;
		self.fetched.clear().await?;
		self.defaults.clear().await?;
		self.metadata.clear();

		Ok(())
	}
}

fn slot_file(context: &AppContext, suffix: &str) -> String {
	format!("{}_{suffix}", context.namespace)
}
