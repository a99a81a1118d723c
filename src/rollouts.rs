//! Publishes activated-state changes to subscribers and logs personalization
//! arm activations.

// std
use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	sync::Mutex,
};
// self
use crate::{_prelude::*, cache::ConfigCache, container::Container, providers::AnalyticsConnector};

/// Analytics origin tag for personalization events.
pub const ANALYTICS_ORIGIN_PERSONALIZATION: &str = "fp";
/// Internal event emitted once per newly observed choice.
pub const INTERNAL_LOG_EVENT: &str = "_fpc";
/// Parameter carrying the choice id on the internal event.
pub const INTERNAL_CHOICE_ID_PARAM: &str = "_fpid";
/// External event describing the full assignment.
pub const EXTERNAL_LOG_EVENT: &str = "personalization_assignment";

/// Snapshot published to rollouts subscribers after an activation.
#[derive(Clone, Debug)]
pub struct RolloutsState {
	/// The container that just became active.
	pub container: Arc<Container>,
	/// Keys whose values changed relative to the previously activated state.
	/// The synthetic publication on subscribe lists every key.
	pub changed_keys: BTreeSet<String>,
}

/// Receives the activated state on registration and after every activation.
pub trait RolloutsStateSubscriber: Send + Sync {
	/// A new activated state is available.
	fn on_rollouts_state(&self, state: RolloutsState);
}

/// Fans activated-state publications out to registered subscribers.
pub struct RolloutsHandler {
	activated: Arc<ConfigCache>,
	subscribers: Mutex<Vec<Arc<dyn RolloutsStateSubscriber>>>,
}
impl RolloutsHandler {
	/// Build a handler over the activated slot.
	pub fn new(activated: Arc<ConfigCache>) -> Self {
		Self { activated, subscribers: Mutex::new(Vec::new()) }
	}

	/// Register a subscriber. When a container is already active the
	/// subscriber receives one synthetic publication covering every key.
	pub async fn add_subscriber(&self, subscriber: Arc<dyn RolloutsStateSubscriber>) {
		self.subscribers.lock().expect("subscriber lock poisoned").push(subscriber.clone());

		if let Some(container) = self.activated.get().await {
			let state = RolloutsState {
				changed_keys: container.configs().keys().cloned().collect(),
				container,
			};

			tokio::spawn(async move { subscriber.on_rollouts_state(state) });
		}
	}

	/// Publish a fresh activation to every subscriber.
	pub fn publish_activation(&self, container: Arc<Container>, changed_keys: BTreeSet<String>) {
		let subscribers =
			self.subscribers.lock().expect("subscriber lock poisoned").clone();

		for subscriber in subscribers {
			let state =
				RolloutsState { container: container.clone(), changed_keys: changed_keys.clone() };

			tokio::spawn(async move { subscriber.on_rollouts_state(state) });
		}
	}
}
impl std::fmt::Debug for RolloutsHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RolloutsHandler")
			.field("activated", &self.activated)
			.field(
				"subscribers",
				&self.subscribers.lock().expect("subscriber lock poisoned").len(),
			)
			.finish()
	}
}

/// Emits one analytics event pair per distinct `(key, choice id)` observed in
/// this process, driven by activated-value resolutions.
pub struct PersonalizationLogger {
	analytics: Arc<dyn AnalyticsConnector>,
	logged_choice_ids: Mutex<HashMap<String, String>>,
}
impl PersonalizationLogger {
	/// Build a logger over the host analytics connector.
	pub fn new(analytics: Arc<dyn AnalyticsConnector>) -> Self {
		Self { analytics, logged_choice_ids: Mutex::new(HashMap::new()) }
	}

	/// Log the assignment for `key` when it is personalized and this choice
	/// has not been logged yet.
	pub fn log_assignment(&self, key: &str, container: &Container) {
		let Some(metadata) = container.personalization_for(key) else {
			return;
		};

		if metadata.choice_id.is_empty() {
			return;
		}

		{
			let mut logged = self.logged_choice_ids.lock().expect("choice-id lock poisoned");

			if logged.get(key) == Some(&metadata.choice_id) {
				return;
			}

			logged.insert(key.to_string(), metadata.choice_id.clone());
		}

		let arm_value = container.get(key).unwrap_or_default().to_string();

		self.analytics.log_event(
			ANALYTICS_ORIGIN_PERSONALIZATION,
			INTERNAL_LOG_EVENT,
			BTreeMap::from([(INTERNAL_CHOICE_ID_PARAM.to_string(), metadata.choice_id.clone())]),
		);
		self.analytics.log_event(
			ANALYTICS_ORIGIN_PERSONALIZATION,
			EXTERNAL_LOG_EVENT,
			BTreeMap::from([
				("choice_id".to_string(), metadata.choice_id.clone()),
				("arm_value".to_string(), arm_value),
				("personalization_id".to_string(), metadata.personalization_id.clone()),
				("arm_index".to_string(), metadata.arm_index.to_string()),
				("group".to_string(), metadata.group.clone()),
			]),
		);
	}
}
impl std::fmt::Debug for PersonalizationLogger {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PersonalizationLogger").finish_non_exhaustive()
	}
}
