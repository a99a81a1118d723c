//! File-backed persistence for a single container slot.

// std
use std::{
	fmt::Debug,
	fs, io,
	path::{Path, PathBuf},
	sync::Mutex,
};
// self
use crate::{_prelude::*, container::Container};

/// Persistence operations for one named container slot.
///
/// A read yielding `Ok(None)` means the slot holds no container; absent and
/// corrupt files are equivalent, and the caller refetches at the next
/// opportunity.
pub trait ContainerStore: Debug + Send + Sync {
	/// Durably write the container, replacing any previous content.
	fn write(&self, container: &Container) -> Result<()>;
	/// Read the stored container, if any.
	fn read(&self) -> Result<Option<Container>>;
	/// Remove the stored container.
	fn clear(&self) -> Result<()>;
}

/// [`ContainerStore`] backed by one JSON blob file on disk.
///
/// Calls are serialized per slot; the interning registry in the engine
/// guarantees a single instance per file name, so the internal mutex is the
/// only writer for its file.
#[derive(Debug)]
pub struct FileStorage {
	path: PathBuf,
	lock: Mutex<()>,
}
impl FileStorage {
	/// Create a storage handle for `file_name` inside `dir`.
	pub fn new(dir: impl AsRef<Path>, file_name: &str) -> Self {
		Self { path: dir.as_ref().join(file_name), lock: Mutex::new(()) }
	}

	/// Path of the backing file.
	pub fn path(&self) -> &Path {
		&self.path
	}
}
impl ContainerStore for FileStorage {
	fn write(&self, container: &Container) -> Result<()> {
		let _guard = self.lock.lock().expect("storage lock poisoned");

		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)?;
		}

		let blob = serde_json::to_vec(container)?;

		fs::write(&self.path, blob)?;

		Ok(())
	}

	fn read(&self) -> Result<Option<Container>> {
		let _guard = self.lock.lock().expect("storage lock poisoned");
		let blob = match fs::read(&self.path) {
			Ok(blob) => blob,
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(err) => {
				tracing::warn!(path = %self.path.display(), error = %err, "container read failed; treating slot as empty");

				return Ok(None);
			},
		};

		match serde_json::from_slice(&blob) {
			Ok(container) => Ok(Some(container)),
			Err(err) => {
				tracing::warn!(path = %self.path.display(), error = %err, "container blob is corrupt; treating slot as empty");

				Ok(None)
			},
		}
	}

	fn clear(&self) -> Result<()> {
		let _guard = self.lock.lock().expect("storage lock poisoned");

		match fs::remove_file(&self.path) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err.into()),
		}
	}
}
