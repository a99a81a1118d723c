//! Memoized single-flight cache wrapping one container storage slot.

// crates.io
use tokio::sync::RwLock;
// self
use crate::{_prelude::*, container::Container, storage::file::ContainerStore};

/// Default bound on synchronizing cache reads.
pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum SlotState {
	/// No read has completed yet, or the previous read failed.
	Unloaded,
	/// The in-memory value is authoritative; `None` records an empty slot.
	Loaded(Option<Arc<Container>>),
}

/// Asynchronous cache for one container slot.
///
/// The first successful read memoizes the slot content; afterwards the
/// in-memory value is authoritative until `put` or `clear`. At most one
/// storage read is in flight per slot; concurrent callers join it. A failed
/// read leaves the slot unloaded so the next `get` retries.
#[derive(Debug)]
pub struct ConfigCache {
	storage: Arc<dyn ContainerStore>,
	state: RwLock<SlotState>,
}
impl ConfigCache {
	/// Wrap a storage slot.
	pub fn new(storage: Arc<dyn ContainerStore>) -> Self {
		Self { storage, state: RwLock::new(SlotState::Unloaded) }
	}

	/// Current container of the slot, reading through to storage on first
	/// use.
	pub async fn get(&self) -> Option<Arc<Container>> {
		{
			let state = self.state.read().await;

			if let SlotState::Loaded(value) = &*state {
				return value.clone();
			}
		}

		// Holding the write guard across the storage read is what makes the
		// read single-flight: racing callers queue here and observe the
		// memoized result instead of issuing their own read.
		let mut state = self.state.write().await;

		if let SlotState::Loaded(value) = &*state {
			return value.clone();
		}

		let storage = self.storage.clone();

		match tokio::task::spawn_blocking(move || storage.read()).await {
			Ok(Ok(container)) => {
				let value = container.map(Arc::new);

				*state = SlotState::Loaded(value.clone());

				value
			},
			Ok(Err(err)) => {
				tracing::warn!(error = %err, "container read failed");

				None
			},
			Err(err) => {
				tracing::warn!(error = %err, "container read task failed");

				None
			},
		}
	}

	/// [`get`](Self::get) bounded by `timeout`; elapsing yields `None` with a
	/// warning.
	pub async fn get_with_timeout(&self, timeout: Duration) -> Option<Arc<Container>> {
		match tokio::time::timeout(timeout, self.get()).await {
			Ok(value) => value,
			Err(_) => {
				tracing::warn!(?timeout, "cache read timed out");

				None
			},
		}
	}

	/// Write `container` through to storage and memoize it.
	pub async fn put(&self, container: Container) -> Result<Arc<Container>> {
		self.put_with(container, true).await
	}

	/// Write `container` through to storage; memoize only when
	/// `update_memory` is set.
	///
	/// The write completes before the memoized value changes, so every value
	/// the cache hands out has been durably written first.
	pub async fn put_with(&self, container: Container, update_memory: bool) -> Result<Arc<Container>> {
		let container = Arc::new(container);
		let mut state = self.state.write().await;
		let storage = self.storage.clone();
		let outgoing = container.clone();

		tokio::task::spawn_blocking(move || storage.write(&outgoing))
			.await
			.map_err(|err| Error::Client(format!("container write task failed: {err}")))??;

		if update_memory {
			*state = SlotState::Loaded(Some(container.clone()));
		}

		Ok(container)
	}

	/// Empty the slot in memory and on disk.
	pub async fn clear(&self) -> Result<()> {
		let mut state = self.state.write().await;
		let storage = self.storage.clone();

		tokio::task::spawn_blocking(move || storage.clear())
			.await
			.map_err(|err| Error::Client(format!("container clear task failed: {err}")))??;

		*state = SlotState::Loaded(None);

		Ok(())
	}
}
