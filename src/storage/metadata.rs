//! Persisted engine metadata: fetch settings, status bookkeeping, backoff
//! state, and developer-defined custom signals.

// std
use std::{
	collections::BTreeMap,
	fs, io,
	path::{Path, PathBuf},
	sync::Mutex,
};
// crates.io
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
// self
use crate::_prelude::*;

/// Default per-fetch network timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Default minimum interval between backend fetches (12 hours).
pub const DEFAULT_MINIMUM_FETCH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
/// Longest accepted custom-signal key, in characters.
pub const CUSTOM_SIGNALS_MAX_KEY_LENGTH: usize = 250;
/// Longest accepted custom-signal value, in characters.
pub const CUSTOM_SIGNALS_MAX_VALUE_LENGTH: usize = 500;
/// Largest accepted custom-signal map.
pub const CUSTOM_SIGNALS_MAX_ENTRIES: usize = 100;

const KEY_FETCH_TIMEOUT: &str = "fetch_timeout_in_seconds";
const KEY_MINIMUM_FETCH_INTERVAL: &str = "minimum_fetch_interval_in_seconds";
const KEY_LAST_FETCH_STATUS: &str = "last_fetch_status";
const KEY_LAST_SUCCESSFUL_FETCH_TIME: &str = "last_successful_fetch_time_in_millis";
const KEY_LAST_FETCH_ETAG: &str = "last_fetch_etag";
const KEY_NUM_FAILED_FETCHES: &str = "num_failed_fetches";
const KEY_BACKOFF_END_TIME: &str = "backoff_end_time_in_millis";
const KEY_NUM_FAILED_STREAMS: &str = "num_failed_realtime_streams";
const KEY_REALTIME_BACKOFF_END_TIME: &str = "realtime_backoff_end_time_in_millis";
const KEY_LAST_TEMPLATE_VERSION: &str = "last_template_version";
const KEY_CUSTOM_SIGNALS: &str = "custom_signals";

/// Outcome of the most recent fetch attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
	/// No fetch has been attempted yet.
	#[default]
	NoFetchYet,
	/// The last fetch completed successfully.
	Success,
	/// The last fetch failed.
	Failure,
	/// The last fetch was suppressed or rejected by throttling.
	Throttled,
}

/// Developer-configurable fetch options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigSettings {
	/// Network timeout applied to each fetch call.
	pub fetch_timeout: Duration,
	/// Minimum age a fetched container must reach before the backend is
	/// consulted again.
	pub minimum_fetch_interval: Duration,
}
impl Default for ConfigSettings {
	fn default() -> Self {
		Self {
			fetch_timeout: DEFAULT_FETCH_TIMEOUT,
			minimum_fetch_interval: DEFAULT_MINIMUM_FETCH_INTERVAL,
		}
	}
}

/// Immutable view of one backoff state, read and written as a unit so callers
/// never observe a torn (count, end-time) pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackoffMetadata {
	/// Consecutive failures observed so far.
	pub num_failures: u32,
	/// Instant until which outgoing requests are suppressed, when set.
	pub backoff_end: Option<DateTime<Utc>>,
}
impl BackoffMetadata {
	/// Whether the backoff window is still closed at `now`.
	pub fn in_window(&self, now: DateTime<Utc>) -> bool {
		self.backoff_end.map(|end| now < end).unwrap_or(false)
	}
}

/// Write-through key/value preferences file.
///
/// The in-memory map is authoritative after open; every mutation persists the
/// whole map under the map lock, so writes are totally ordered.
#[derive(Debug)]
struct PrefsFile {
	path: PathBuf,
	values: Mutex<Map<String, Value>>,
}
impl PrefsFile {
	fn open(dir: impl AsRef<Path>, file_name: &str) -> Self {
		let path = dir.as_ref().join(file_name);
		let values = match fs::read(&path) {
			Ok(blob) => match serde_json::from_slice::<Map<String, Value>>(&blob) {
				Ok(values) => values,
				Err(err) => {
					tracing::warn!(path = %path.display(), error = %err, "preferences file is corrupt; starting empty");

					Map::new()
				},
			},
			Err(err) if err.kind() == io::ErrorKind::NotFound => Map::new(),
			Err(err) => {
				tracing::warn!(path = %path.display(), error = %err, "preferences file unreadable; starting empty");

				Map::new()
			},
		};

		Self { path, values: Mutex::new(values) }
	}

	fn get(&self, key: &str) -> Option<Value> {
		self.values.lock().expect("prefs lock poisoned").get(key).cloned()
	}

	/// Apply every entry (`None` removes the key) and persist when anything
	/// changed. Returns whether a change was written.
	fn set_many(&self, entries: &[(&str, Option<Value>)]) -> bool {
		let mut values = self.values.lock().expect("prefs lock poisoned");
		let mut changed = false;

		for (key, value) in entries {
			match value {
				Some(value) =>
					if values.get(*key) != Some(value) {
						values.insert((*key).to_string(), value.clone());

						changed = true;
					},
				None =>
					if values.remove(*key).is_some() {
						changed = true;
					},
			}
		}

		if changed {
			self.persist(&values);
		}

		changed
	}

	fn clear(&self) {
		let mut values = self.values.lock().expect("prefs lock poisoned");

		if !values.is_empty() {
			values.clear();
			self.persist(&values);
		}
	}

	fn persist(&self, values: &Map<String, Value>) {
		let write = || -> Result<()> {
			if let Some(parent) = self.path.parent() {
				fs::create_dir_all(parent)?;
			}

			fs::write(&self.path, serde_json::to_vec(values)?)?;

			Ok(())
		};

		if let Err(err) = write() {
			tracing::warn!(path = %self.path.display(), error = %err, "failed to persist preferences");
		}
	}
}

/// Persisted metadata record of the engine.
///
/// Four independent coarse-grained sections (info, fetch backoff, realtime
/// backoff, custom signals) each serialize their own read-modify-write
/// sequences; the backing preferences map is write-through.
#[derive(Debug)]
pub struct MetadataStore {
	prefs: PrefsFile,
	info: Mutex<()>,
	fetch_backoff: Mutex<()>,
	realtime_backoff: Mutex<()>,
	custom_signals: Mutex<()>,
}
impl MetadataStore {
	/// Open or create the metadata store at `dir/file_name`.
	pub fn open(dir: impl AsRef<Path>, file_name: &str) -> Self {
		Self {
			prefs: PrefsFile::open(dir, file_name),
			info: Mutex::new(()),
			fetch_backoff: Mutex::new(()),
			realtime_backoff: Mutex::new(()),
			custom_signals: Mutex::new(()),
		}
	}

	/// Current developer-configurable settings.
	pub fn config_settings(&self) -> ConfigSettings {
		ConfigSettings {
			fetch_timeout: self
				.get_u64(KEY_FETCH_TIMEOUT)
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_FETCH_TIMEOUT),
			minimum_fetch_interval: self
				.get_u64(KEY_MINIMUM_FETCH_INTERVAL)
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_MINIMUM_FETCH_INTERVAL),
		}
	}

	/// Replace the developer-configurable settings.
	pub fn set_config_settings(&self, settings: &ConfigSettings) {
		let _section = self.info.lock().expect("info lock poisoned");

		self.prefs.set_many(&[
			(KEY_FETCH_TIMEOUT, Some(settings.fetch_timeout.as_secs().into())),
			(KEY_MINIMUM_FETCH_INTERVAL, Some(settings.minimum_fetch_interval.as_secs().into())),
		]);
	}

	/// Network timeout applied to each fetch call.
	pub fn fetch_timeout(&self) -> Duration {
		self.config_settings().fetch_timeout
	}

	/// Minimum age a fetched container must reach before refetching.
	pub fn minimum_fetch_interval(&self) -> Duration {
		self.config_settings().minimum_fetch_interval
	}

	/// Outcome of the most recent fetch attempt.
	pub fn last_fetch_status(&self) -> FetchStatus {
		self.prefs
			.get(KEY_LAST_FETCH_STATUS)
			.and_then(|value| serde_json::from_value(value).ok())
			.unwrap_or_default()
	}

	/// Record a successful fetch observed at `fetch_time`.
	///
	/// The last-successful-fetch timestamp only ever advances; a success
	/// reported with an older captured time does not move it backwards.
	pub fn record_fetch_success(&self, fetch_time: DateTime<Utc>) {
		let _section = self.info.lock().expect("info lock poisoned");
		let advanced = self
			.last_successful_fetch_time_locked()
			.map(|previous| previous.max(fetch_time))
			.unwrap_or(fetch_time);

		self.prefs.set_many(&[
			(KEY_LAST_FETCH_STATUS, Some(status_value(FetchStatus::Success))),
			(KEY_LAST_SUCCESSFUL_FETCH_TIME, Some(advanced.timestamp_millis().into())),
		]);
	}

	/// Record a failed fetch attempt.
	pub fn record_fetch_failure(&self) {
		let _section = self.info.lock().expect("info lock poisoned");

		self.prefs.set_many(&[(KEY_LAST_FETCH_STATUS, Some(status_value(FetchStatus::Failure)))]);
	}

	/// Record a throttled fetch attempt.
	pub fn record_fetch_throttled(&self) {
		let _section = self.info.lock().expect("info lock poisoned");

		self.prefs.set_many(&[(KEY_LAST_FETCH_STATUS, Some(status_value(FetchStatus::Throttled)))]);
	}

	/// Time of the most recent successful fetch, when one has happened.
	pub fn last_successful_fetch_time(&self) -> Option<DateTime<Utc>> {
		self.last_successful_fetch_time_locked()
	}

	/// ETag returned by the backend on the most recent fetch.
	pub fn last_fetch_etag(&self) -> Option<String> {
		self.prefs.get(KEY_LAST_FETCH_ETAG).and_then(|value| match value {
			Value::String(etag) => Some(etag),
			_ => None,
		})
	}

	/// Persist the ETag returned by the backend.
	pub fn set_last_fetch_etag(&self, etag: &str) {
		let _section = self.info.lock().expect("info lock poisoned");

		self.prefs.set_many(&[(KEY_LAST_FETCH_ETAG, Some(etag.into()))]);
	}

	/// Most recently observed template version; zero when unknown.
	pub fn last_template_version(&self) -> u64 {
		self.get_u64(KEY_LAST_TEMPLATE_VERSION).unwrap_or(0)
	}

	/// Persist the template version carried by a fetched container.
	pub fn set_last_template_version(&self, version: u64) {
		let _section = self.info.lock().expect("info lock poisoned");

		self.prefs.set_many(&[(KEY_LAST_TEMPLATE_VERSION, Some(version.into()))]);
	}

	/// Fetch backoff state as one consistent value.
	pub fn fetch_backoff(&self) -> BackoffMetadata {
		let _section = self.fetch_backoff.lock().expect("fetch backoff lock poisoned");

		self.read_backoff(KEY_NUM_FAILED_FETCHES, KEY_BACKOFF_END_TIME)
	}

	/// Persist a new fetch backoff state.
	pub fn set_fetch_backoff(&self, backoff: BackoffMetadata) {
		let _section = self.fetch_backoff.lock().expect("fetch backoff lock poisoned");

		self.write_backoff(KEY_NUM_FAILED_FETCHES, KEY_BACKOFF_END_TIME, backoff);
	}

	/// Reset the fetch backoff state to no failures.
	pub fn reset_fetch_backoff(&self) {
		self.set_fetch_backoff(BackoffMetadata::default());
	}

	/// Realtime-stream backoff state as one consistent value.
	pub fn realtime_backoff(&self) -> BackoffMetadata {
		let _section = self.realtime_backoff.lock().expect("realtime backoff lock poisoned");

		self.read_backoff(KEY_NUM_FAILED_STREAMS, KEY_REALTIME_BACKOFF_END_TIME)
	}

	/// Persist a new realtime-stream backoff state.
	pub fn set_realtime_backoff(&self, backoff: BackoffMetadata) {
		let _section = self.realtime_backoff.lock().expect("realtime backoff lock poisoned");

		self.write_backoff(KEY_NUM_FAILED_STREAMS, KEY_REALTIME_BACKOFF_END_TIME, backoff);
	}

	/// Reset the realtime-stream backoff state to no failures.
	pub fn reset_realtime_backoff(&self) {
		self.set_realtime_backoff(BackoffMetadata::default());
	}

	/// Developer-defined custom signals sent with fetch requests.
	pub fn custom_signals(&self) -> BTreeMap<String, String> {
		self.prefs
			.get(KEY_CUSTOM_SIGNALS)
			.and_then(|value| serde_json::from_value(value).ok())
			.unwrap_or_default()
	}

	/// Merge a custom-signals update; `None` values remove their key.
	///
	/// The whole update is discarded with a warning when any key exceeds
	/// [`CUSTOM_SIGNALS_MAX_KEY_LENGTH`], any value exceeds
	/// [`CUSTOM_SIGNALS_MAX_VALUE_LENGTH`], or the merged map would exceed
	/// [`CUSTOM_SIGNALS_MAX_ENTRIES`]. Returns whether anything was written;
	/// an update that leaves the persisted map unchanged is a no-op.
	pub fn update_custom_signals(&self, updates: BTreeMap<String, Option<String>>) -> bool {
		let _section = self.custom_signals.lock().expect("custom signals lock poisoned");

		for (key, value) in &updates {
			if key.chars().count() > CUSTOM_SIGNALS_MAX_KEY_LENGTH {
				tracing::warn!(%key, "custom-signal key exceeds {CUSTOM_SIGNALS_MAX_KEY_LENGTH} characters; update discarded");

				return false;
			}
			if let Some(value) = value
				&& value.chars().count() > CUSTOM_SIGNALS_MAX_VALUE_LENGTH
			{
				tracing::warn!(%key, "custom-signal value exceeds {CUSTOM_SIGNALS_MAX_VALUE_LENGTH} characters; update discarded");

				return false;
			}
		}

		let mut merged = self.custom_signals();

		for (key, value) in updates {
			match value {
				Some(value) => {
					merged.insert(key, value);
				},
				None => {
					merged.remove(&key);
				},
			}
		}

		if merged.len() > CUSTOM_SIGNALS_MAX_ENTRIES {
			tracing::warn!(
				entries = merged.len(),
				"custom-signal map exceeds {CUSTOM_SIGNALS_MAX_ENTRIES} entries; update discarded"
			);

			return false;
		}

		let value = serde_json::to_value(&merged).expect("string map serializes");

		self.prefs.set_many(&[(KEY_CUSTOM_SIGNALS, Some(value))])
	}

	/// Drop every persisted value, returning the store to its defaults.
	pub fn clear(&self) {
		let _info = self.info.lock().expect("info lock poisoned");
		let _fetch = self.fetch_backoff.lock().expect("fetch backoff lock poisoned");
		let _realtime = self.realtime_backoff.lock().expect("realtime backoff lock poisoned");
		let _signals = self.custom_signals.lock().expect("custom signals lock poisoned");

		self.prefs.clear();
	}

	fn last_successful_fetch_time_locked(&self) -> Option<DateTime<Utc>> {
		self.prefs
			.get(KEY_LAST_SUCCESSFUL_FETCH_TIME)
			.and_then(|value| value.as_i64())
			.filter(|millis| *millis >= 0)
			.and_then(DateTime::from_timestamp_millis)
	}

	fn read_backoff(&self, failures_key: &str, end_key: &str) -> BackoffMetadata {
		BackoffMetadata {
			num_failures: self.get_u64(failures_key).unwrap_or(0) as u32,
			backoff_end: self
				.prefs
				.get(end_key)
				.and_then(|value| value.as_i64())
				.and_then(DateTime::from_timestamp_millis),
		}
	}

	fn write_backoff(&self, failures_key: &str, end_key: &str, backoff: BackoffMetadata) {
		self.prefs.set_many(&[
			(failures_key, Some(backoff.num_failures.into())),
			(end_key, backoff.backoff_end.map(|end| end.timestamp_millis().into())),
		]);
	}

	fn get_u64(&self, key: &str) -> Option<u64> {
		self.prefs.get(key).and_then(|value| value.as_u64())
	}
}

fn status_value(status: FetchStatus) -> Value {
	serde_json::to_value(status).expect("fetch status serializes")
}
