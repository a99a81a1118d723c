//! Update-listener registry and stream task lifecycle.

// std
use std::{
	collections::{BTreeSet, HashMap},
	sync::{
		Mutex,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
};
// crates.io
use reqwest::Client;
use tokio::task::JoinHandle;
use url::Url;
// self
use crate::{
	_prelude::*,
	providers::{AppContext, InstallationsProvider},
	realtime::{autofetch::AutoFetcher, stream::StreamTask},
	storage::metadata::MetadataStore,
};

/// A config update pushed to registered listeners.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
	/// Parameter keys whose backend values differ from the activated state.
	pub updated_keys: BTreeSet<String>,
}

/// Callback interface for realtime config updates.
pub trait ConfigUpdateListener: Send + Sync {
	/// A newer template was fetched; `update` lists the keys that changed
	/// relative to the activated container.
	fn on_update(&self, update: ConfigUpdate);
	/// The stream failed, was disabled by the backend, or autofetch exhausted
	/// its attempt budget.
	fn on_error(&self, error: &Error);
}

/// Registered update listeners. Mutation happens under the lock; iteration
/// snapshots the set so callbacks never run while the lock is held.
#[derive(Default)]
pub struct ListenerSet {
	inner: Mutex<HashMap<u64, Arc<dyn ConfigUpdateListener>>>,
	next_id: AtomicU64,
}
impl ListenerSet {
	pub(crate) fn add(&self, listener: Arc<dyn ConfigUpdateListener>) -> u64 {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);

		self.inner.lock().expect("listener lock poisoned").insert(id, listener);

		id
	}

	pub(crate) fn remove(&self, id: u64) -> bool {
		self.inner.lock().expect("listener lock poisoned").remove(&id).is_some()
	}

	/// Whether no listener is currently registered.
	pub fn is_empty(&self) -> bool {
		self.inner.lock().expect("listener lock poisoned").is_empty()
	}

	fn snapshot(&self) -> Vec<Arc<dyn ConfigUpdateListener>> {
		self.inner.lock().expect("listener lock poisoned").values().cloned().collect()
	}

	/// Deliver an update to every registered listener.
	pub fn notify_update(&self, update: &ConfigUpdate) {
		for listener in self.snapshot() {
			listener.on_update(update.clone());
		}
	}

	/// Deliver an error to every registered listener.
	pub fn notify_error(&self, error: &Error) {
		for listener in self.snapshot() {
			listener.on_error(error);
		}
	}
}
impl std::fmt::Debug for ListenerSet {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ListenerSet")
			.field("len", &self.inner.lock().expect("listener lock poisoned").len())
			.finish()
	}
}

/// Registration handle returned by
/// [`StreamController::add_listener`]; call [`remove`](Self::remove) to
/// unsubscribe.
#[derive(Debug)]
pub struct ListenerHandle {
	id: u64,
	controller: StreamController,
}
impl ListenerHandle {
	/// Unsubscribe the listener. Removing the last listener stops the
	/// background stream.
	pub fn remove(self) {
		self.controller.remove_listener(self.id);
	}
}

/// Owns the single optional background stream task and the listener set.
///
/// A stream connection exists exactly while the listener set is non-empty:
/// registering the first listener spawns the task, removing the last aborts
/// it. Once the backend disables realtime the controller stays quiet for the
/// rest of the process lifetime.
#[derive(Clone, Debug)]
pub struct StreamController {
	inner: Arc<ControllerInner>,
}
#[derive(Debug)]
struct ControllerInner {
	client: Client,
	endpoint: Url,
	context: Arc<AppContext>,
	installations: Arc<dyn InstallationsProvider>,
	metadata: Arc<MetadataStore>,
	autofetch: Arc<AutoFetcher>,
	listeners: Arc<ListenerSet>,
	task: Mutex<Option<JoinHandle<()>>>,
	disabled: Arc<AtomicBool>,
}
impl StreamController {
	/// Assemble a controller around its collaborators.
	pub fn new(
		client: Client,
		endpoint: Url,
		context: Arc<AppContext>,
		installations: Arc<dyn InstallationsProvider>,
		metadata: Arc<MetadataStore>,
		autofetch: Arc<AutoFetcher>,
		listeners: Arc<ListenerSet>,
	) -> Self {
		Self {
			inner: Arc::new(ControllerInner {
				client,
				endpoint,
				context,
				installations,
				metadata,
				autofetch,
				listeners,
				task: Mutex::new(None),
				disabled: Arc::new(AtomicBool::new(false)),
			}),
		}
	}

	/// Register an update listener, starting the stream when it is the first.
	pub fn add_listener(&self, listener: Arc<dyn ConfigUpdateListener>) -> ListenerHandle {
		let id = self.inner.listeners.add(listener);

		self.ensure_running();

		ListenerHandle { id, controller: self.clone() }
	}

	fn remove_listener(&self, id: u64) {
		if self.inner.listeners.remove(id) && self.inner.listeners.is_empty() {
			let task = self.inner.task.lock().expect("task lock poisoned").take();

			if let Some(task) = task {
				tracing::debug!("last update listener removed; cancelling stream task");
				task.abort();
			}
		}
	}

	fn ensure_running(&self) {
		let mut task = self.inner.task.lock().expect("task lock poisoned");
		let running = task.as_ref().map(|task| !task.is_finished()).unwrap_or(false);

		if running
			|| self.inner.disabled.load(Ordering::Acquire)
			|| self.inner.listeners.is_empty()
		{
			return;
		}

		let stream = StreamTask::new(
			self.inner.client.clone(),
			self.inner.endpoint.clone(),
			self.inner.context.clone(),
			self.inner.installations.clone(),
			self.inner.metadata.clone(),
			self.inner.listeners.clone(),
			self.inner.autofetch.clone(),
			self.inner.disabled.clone(),
		);

		*task = Some(tokio::spawn(stream.run()));
	}

	/// Whether a stream task is currently alive.
	pub fn is_streaming(&self) -> bool {
		self.inner
			.task
			.lock()
			.expect("task lock poisoned")
			.as_ref()
			.map(|task| !task.is_finished())
			.unwrap_or(false)
	}
}
