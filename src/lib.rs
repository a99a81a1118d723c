//! Client-side remote configuration engine with two-tier caching, fetch
//! throttling, and realtime update streaming — built for modern Rust
//! applications.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod container;
pub mod diff;
pub mod fetch;
pub mod metrics;
pub mod providers;
pub mod realtime;
pub mod resolver;
pub mod rollouts;
pub mod storage;

mod engine;
mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}
#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	engine::{ConfigEngine, DEFAULT_BASE_URL, EngineBuilder, SlotRegistry},
	error::{Error, Result},
	fetch::handler::{FetchOutcome, FetchResult},
	providers::{AnalyticsConnector, AppContext, DEFAULT_NAMESPACE, InstallationsProvider},
	realtime::controller::{ConfigUpdate, ConfigUpdateListener, ListenerHandle, StreamController},
	resolver::{ConfigValue, ValueSource},
	rollouts::{RolloutsState, RolloutsStateSubscriber},
	storage::metadata::{BackoffMetadata, ConfigSettings, FetchStatus},
};
