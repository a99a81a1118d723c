//! Typed parameter accessors layering activated values, developer defaults,
//! and static per-type defaults.

// std
use std::{
	collections::{BTreeMap, BTreeSet},
	sync::RwLock,
};
// self
use crate::{_prelude::*, cache::{ConfigCache, DEFAULT_GET_TIMEOUT}, container::Container};

/// Static default served when a key resolves nowhere: string.
pub const DEFAULT_VALUE_FOR_STRING: &str = "";
/// Static default served when a key resolves nowhere: long.
pub const DEFAULT_VALUE_FOR_LONG: i64 = 0;
/// Static default served when a key resolves nowhere: double.
pub const DEFAULT_VALUE_FOR_DOUBLE: f64 = 0.0;
/// Static default served when a key resolves nowhere: boolean.
pub const DEFAULT_VALUE_FOR_BOOLEAN: bool = false;

/// Which layer a [`ConfigValue`] was resolved from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueSource {
	/// Nothing held the key; per-type static defaults apply.
	Static,
	/// The developer-supplied defaults container.
	Default,
	/// The activated container.
	Remote,
}

/// An opaque parameter value tagged with its source, coercing on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigValue {
	value: String,
	source: ValueSource,
}
impl ConfigValue {
	pub(crate) fn remote(value: impl Into<String>) -> Self {
		Self { value: value.into(), source: ValueSource::Remote }
	}

	pub(crate) fn from_defaults(value: impl Into<String>) -> Self {
		Self { value: value.into(), source: ValueSource::Default }
	}

	pub(crate) fn static_default() -> Self {
		Self { value: DEFAULT_VALUE_FOR_STRING.into(), source: ValueSource::Static }
	}

	/// Layer the value was resolved from.
	pub fn source(&self) -> ValueSource {
		self.source
	}

	/// The value as a string; static values yield the empty string.
	pub fn as_str(&self) -> &str {
		match self.source {
			ValueSource::Static => DEFAULT_VALUE_FOR_STRING,
			_ => &self.value,
		}
	}

	/// The UTF-8 bytes of the value; static values yield an empty slice.
	pub fn as_bytes(&self) -> &[u8] {
		self.as_str().as_bytes()
	}

	/// Coerce to boolean; unlike [`ParamResolver::get_bool`] a non-static
	/// value that fails coercion is an error instead of falling through.
	pub fn as_bool(&self) -> Result<bool> {
		match self.source {
			ValueSource::Static => Ok(DEFAULT_VALUE_FOR_BOOLEAN),
			_ => parse_bool(&self.value)
				.ok_or_else(|| Error::Coercion { value: self.value.clone(), target: "boolean" }),
		}
	}

	/// Coerce to a signed 64-bit integer.
	pub fn as_long(&self) -> Result<i64> {
		match self.source {
			ValueSource::Static => Ok(DEFAULT_VALUE_FOR_LONG),
			_ => self
				.value
				.trim()
				.parse()
				.map_err(|_| Error::Coercion { value: self.value.clone(), target: "long" }),
		}
	}

	/// Coerce to an IEEE-754 double.
	pub fn as_double(&self) -> Result<f64> {
		match self.source {
			ValueSource::Static => Ok(DEFAULT_VALUE_FOR_DOUBLE),
			_ => self
				.value
				.trim()
				.parse()
				.map_err(|_| Error::Coercion { value: self.value.clone(), target: "double" }),
		}
	}
}

/// Callback invoked whenever a lookup resolves via the activated container.
pub type ResolutionListener = dyn Fn(&str, &Arc<Container>) + Send + Sync;

/// Resolves typed parameter values across the activated and defaults caches.
pub struct ParamResolver {
	activated: Arc<ConfigCache>,
	defaults: Arc<ConfigCache>,
	listeners: RwLock<Vec<Arc<ResolutionListener>>>,
}
impl ParamResolver {
	/// Build a resolver over the activated and defaults slots.
	pub fn new(activated: Arc<ConfigCache>, defaults: Arc<ConfigCache>) -> Self {
		Self { activated, defaults, listeners: RwLock::new(Vec::new()) }
	}

	/// Register a callback for activated-value resolutions. Callbacks run
	/// fire-and-forget on spawned tasks; they never block or fail the lookup.
	pub fn add_listener(&self, listener: Arc<ResolutionListener>) {
		self.listeners.write().expect("listener lock poisoned").push(listener);
	}

	/// String value for `key`: activated, then defaults, then `""`.
	pub async fn get_string(&self, key: &str) -> String {
		if let Some(container) = self.activated().await
			&& let Some(value) = container.get(key)
		{
			let value = value.to_string();

			self.notify_activated_use(key, &container);

			return value;
		}
		if let Some(container) = self.defaults().await
			&& let Some(value) = container.get(key)
		{
			return value.to_string();
		}

		tracing::warn!(key, "no string value; returning static default");

		DEFAULT_VALUE_FOR_STRING.to_string()
	}

	/// Boolean value for `key`. A layer whose string does not match the
	/// truth sets falls through to the next layer.
	pub async fn get_bool(&self, key: &str) -> bool {
		if let Some(container) = self.activated().await
			&& let Some(value) = container.get(key).and_then(parse_bool)
		{
			self.notify_activated_use(key, &container);

			return value;
		}
		if let Some(container) = self.defaults().await
			&& let Some(value) = container.get(key).and_then(parse_bool)
		{
			return value;
		}

		tracing::warn!(key, "no boolean value; returning static default");

		DEFAULT_VALUE_FOR_BOOLEAN
	}

	/// Long value for `key`; unparseable layers fall through.
	pub async fn get_long(&self, key: &str) -> i64 {
		if let Some(container) = self.activated().await
			&& let Some(value) = container.get(key).and_then(parse_trimmed::<i64>)
		{
			self.notify_activated_use(key, &container);

			return value;
		}
		if let Some(container) = self.defaults().await
			&& let Some(value) = container.get(key).and_then(parse_trimmed::<i64>)
		{
			return value;
		}

		tracing::warn!(key, "no long value; returning static default");

		DEFAULT_VALUE_FOR_LONG
	}

	/// Double value for `key`; unparseable layers fall through.
	pub async fn get_double(&self, key: &str) -> f64 {
		if let Some(container) = self.activated().await
			&& let Some(value) = container.get(key).and_then(parse_trimmed::<f64>)
		{
			self.notify_activated_use(key, &container);

			return value;
		}
		if let Some(container) = self.defaults().await
			&& let Some(value) = container.get(key).and_then(parse_trimmed::<f64>)
		{
			return value;
		}

		tracing::warn!(key, "no double value; returning static default");

		DEFAULT_VALUE_FOR_DOUBLE
	}

	/// UTF-8 bytes of the string value for `key`; empty when unresolved.
	pub async fn get_byte_array(&self, key: &str) -> Vec<u8> {
		self.get_string(key).await.into_bytes()
	}

	/// Opaque value for `key` tagged with its source.
	pub async fn get_value(&self, key: &str) -> ConfigValue {
		if let Some(container) = self.activated().await
			&& let Some(value) = container.get(key)
		{
			let value = ConfigValue::remote(value);

			self.notify_activated_use(key, &container);

			return value;
		}
		if let Some(container) = self.defaults().await
			&& let Some(value) = container.get(key)
		{
			return ConfigValue::from_defaults(value);
		}

		ConfigValue::static_default()
	}

	/// Keys starting with `prefix` across activated and defaults, in
	/// ascending lexicographic order.
	pub async fn get_keys_by_prefix(&self, prefix: &str) -> BTreeSet<String> {
		let mut keys = BTreeSet::new();

		for container in [self.activated().await, self.defaults().await].into_iter().flatten() {
			keys.extend(
				container.configs().keys().filter(|key| key.starts_with(prefix)).cloned(),
			);
		}

		keys
	}

	/// Every known key resolved through [`get_value`](Self::get_value).
	pub async fn get_all(&self) -> BTreeMap<String, ConfigValue> {
		let mut all = BTreeMap::new();

		for key in self.get_keys_by_prefix("").await {
			let value = self.get_value(&key).await;

			all.insert(key, value);
		}

		all
	}

	async fn activated(&self) -> Option<Arc<Container>> {
		self.activated.get_with_timeout(DEFAULT_GET_TIMEOUT).await
	}

	async fn defaults(&self) -> Option<Arc<Container>> {
		self.defaults.get_with_timeout(DEFAULT_GET_TIMEOUT).await
	}

	fn notify_activated_use(&self, key: &str, container: &Arc<Container>) {
		let listeners = self.listeners.read().expect("listener lock poisoned").clone();

		for listener in listeners {
			let key = key.to_string();
			let container = container.clone();

			tokio::spawn(async move { listener(&key, &container) });
		}
	}
}
impl std::fmt::Debug for ParamResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ParamResolver")
			.field("activated", &self.activated)
			.field("defaults", &self.defaults)
			.field(
				"listeners",
				&self.listeners.read().expect("listener lock poisoned").len(),
			)
			.finish()
	}
}

fn parse_bool(raw: &str) -> Option<bool> {
	match raw.to_ascii_lowercase().as_str() {
		"1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
		"0" | "false" | "f" | "no" | "n" | "off" | "" => Some(false),
		_ => None,
	}
}

fn parse_trimmed<T: std::str::FromStr>(raw: &str) -> Option<T> {
	raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
	// std
	use std::path::Path;
	// crates.io
	use tokio::sync::mpsc;
	// self
	use super::*;
	use crate::storage::file::FileStorage;

	fn resolver(dir: &Path) -> ParamResolver {
		let activated = Arc::new(ConfigCache::new(Arc::new(FileStorage::new(dir, "activate.json"))));
		let defaults = Arc::new(ConfigCache::new(Arc::new(FileStorage::new(dir, "defaults.json"))));

		ParamResolver::new(activated, defaults)
	}

	async fn seeded(dir: &Path) -> ParamResolver {
		let resolver = resolver(dir);

		resolver
			.activated
			.put(
				Container::builder()
					.config("greeting", "hello")
					.config("flag", "TRUE")
					.config("broken_flag", "certainly")
					.config("retries", " 3 ")
					.config("ratio", "0.5")
					.fetch_time(Utc::now())
					.build(),
			)
			.await
			.expect("seed activated");
		resolver
			.defaults
			.put(
				Container::builder()
					.config("greeting", "hi")
					.config("lang", "en")
					.config("broken_flag", "off")
					.build(),
			)
			.await
			.expect("seed defaults");

		resolver
	}

	#[tokio::test]
	async fn string_lookup_layers_activated_then_defaults_then_static() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = seeded(dir.path()).await;

		assert_eq!(resolver.get_string("greeting").await, "hello");
		assert_eq!(resolver.get_string("lang").await, "en");
		assert_eq!(resolver.get_string("missing").await, "");
	}

	#[tokio::test]
	async fn boolean_truth_sets_are_total_and_case_insensitive() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = resolver(dir.path());
		let mut truthy = Container::builder();

		for (index, raw) in ["1", "true", "t", "yes", "y", "on", "TRUE", "On"].iter().enumerate() {
			truthy = truthy.config(format!("k{index}"), *raw);
		}

		resolver.activated.put(truthy.fetch_time(Utc::now()).build()).await.expect("seed");

		for index in 0..8 {
			assert!(resolver.get_bool(&format!("k{index}")).await, "k{index} should be true");
		}

		resolver.activated.clear().await.expect("clear");

		let mut falsy = Container::builder();

		for (index, raw) in ["0", "false", "f", "no", "n", "off", "", "OFF"].iter().enumerate() {
			falsy = falsy.config(format!("k{index}"), *raw);
		}

		resolver.activated.put(falsy.fetch_time(Utc::now()).build()).await.expect("seed");

		for index in 0..8 {
			assert!(!resolver.get_bool(&format!("k{index}")).await, "k{index} should be false");
		}
	}

	#[tokio::test]
	async fn unmatched_boolean_falls_through_to_defaults() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = seeded(dir.path()).await;

		// Activated holds "certainly", which matches neither truth set; the
		// defaults layer resolves it to false.
		assert!(!resolver.get_bool("broken_flag").await);
		assert!(!resolver.get_bool("missing").await);
	}

	#[tokio::test]
	async fn numeric_lookups_trim_and_fall_through() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = seeded(dir.path()).await;

		assert_eq!(resolver.get_long("retries").await, 3);
		assert_eq!(resolver.get_double("ratio").await, 0.5);
		assert_eq!(resolver.get_long("greeting").await, 0);
		assert_eq!(resolver.get_double("missing").await, 0.0);
	}

	#[tokio::test]
	async fn byte_array_is_the_utf8_encoding() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = seeded(dir.path()).await;

		assert_eq!(resolver.get_byte_array("greeting").await, b"hello".to_vec());
		assert!(resolver.get_byte_array("missing").await.is_empty());
	}

	#[tokio::test]
	async fn values_are_tagged_with_their_source() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = seeded(dir.path()).await;

		assert_eq!(resolver.get_value("greeting").await.source(), ValueSource::Remote);
		assert_eq!(resolver.get_value("lang").await.source(), ValueSource::Default);

		let missing = resolver.get_value("missing").await;

		assert_eq!(missing.source(), ValueSource::Static);
		assert_eq!(missing.as_str(), "");
		assert_eq!(missing.as_long().expect("static long"), 0);
		assert!(!missing.as_bool().expect("static bool"));
	}

	#[tokio::test]
	async fn non_static_values_error_instead_of_falling_through() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = seeded(dir.path()).await;
		let value = resolver.get_value("greeting").await;

		assert!(matches!(value.as_long(), Err(Error::Coercion { target: "long", .. })));
		assert!(matches!(value.as_bool(), Err(Error::Coercion { target: "boolean", .. })));
		assert_eq!(value.as_str(), "hello");
	}

	#[tokio::test]
	async fn prefix_listing_unions_both_layers_in_order() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = resolver(dir.path());

		resolver
			.activated
			.put(
				Container::builder()
					.config("exp_b", "1")
					.config("exp_a", "1")
					.config("other", "1")
					.fetch_time(Utc::now())
					.build(),
			)
			.await
			.expect("seed activated");
		resolver
			.defaults
			.put(Container::builder().config("exp_c", "1").config("exp_a", "2").build())
			.await
			.expect("seed defaults");

		let keys: Vec<_> = resolver.get_keys_by_prefix("exp_").await.into_iter().collect();

		assert_eq!(keys, ["exp_a", "exp_b", "exp_c"]);
	}

	#[tokio::test]
	async fn get_all_resolves_every_known_key() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = seeded(dir.path()).await;
		let all = resolver.get_all().await;

		assert_eq!(all["greeting"].as_str(), "hello");
		assert_eq!(all["greeting"].source(), ValueSource::Remote);
		assert_eq!(all["lang"].as_str(), "en");
		assert_eq!(all["lang"].source(), ValueSource::Default);
	}

	#[tokio::test]
	async fn activated_resolutions_notify_listeners() {
		let dir = tempfile::tempdir().expect("tempdir");
		let resolver = seeded(dir.path()).await;
		let (tx, mut rx) = mpsc::unbounded_channel();

		resolver.add_listener(Arc::new(move |key: &str, _: &Arc<Container>| {
			let _ = tx.send(key.to_string());
		}));

		resolver.get_string("greeting").await;
		// Defaults-only and missing lookups must not notify.
		resolver.get_string("lang").await;
		resolver.get_string("missing").await;

		let notified =
			tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("notification");

		assert_eq!(notified.as_deref(), Some("greeting"));
		assert!(rx.try_recv().is_err());
	}
}
