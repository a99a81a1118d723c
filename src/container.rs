//! Immutable parameter-container snapshots and their builder.

// std
use std::collections::BTreeMap;
// crates.io
use chrono::serde::ts_milliseconds;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
// self
use crate::_prelude::*;

/// Experiment descriptor binding an experiment id to its affected parameter
/// keys, carrying the remaining backend metadata opaquely.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentDescriptor {
	/// Backend-assigned experiment identifier.
	#[serde(rename = "experimentId")]
	pub experiment_id: String,
	/// Parameter keys affected by the experiment; may be empty when the
	/// backend does not scope the experiment to specific parameters.
	#[serde(rename = "affectedParameterKey", default, skip_serializing_if = "Vec::is_empty")]
	pub affected_parameter_keys: Vec<String>,
	/// Opaque experiment payload (trigger events, timestamps, variant data).
	#[serde(flatten)]
	pub metadata: Map<String, Value>,
}
impl ExperimentDescriptor {
	/// The descriptor with the affected-parameter list stripped, used to
	/// compare two descriptors for metadata-only changes.
	pub fn without_affected_keys(&self) -> Self {
		Self {
			experiment_id: self.experiment_id.clone(),
			affected_parameter_keys: Vec::new(),
			metadata: self.metadata.clone(),
		}
	}
}

/// Personalization assignment metadata attached to a single parameter key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalizationMetadata {
	/// Server-minted identifier of the assignment for one (parameter, user)
	/// pair; empty when the parameter is not personalized.
	#[serde(rename = "choiceId", default)]
	pub choice_id: String,
	/// Identifier of the personalization that produced the assignment.
	#[serde(rename = "personalizationId", default)]
	pub personalization_id: String,
	/// Index of the arm served to this user.
	#[serde(rename = "armIndex", default)]
	pub arm_index: i64,
	/// Experiment group the user was bucketed into.
	#[serde(default)]
	pub group: String,
	/// Opaque remainder of the assignment payload.
	#[serde(flatten)]
	pub extras: Map<String, Value>,
}

/// An immutable snapshot of parameter values plus the experiment and
/// personalization metadata that shipped with them.
///
/// Containers are created by the storage layer on read, by the fetch handler
/// on a successful backend response, and by the defaults-loading path. They
/// are never mutated after construction; all modifications produce a new
/// container via [`ContainerBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
	configs: BTreeMap<String, String>,
	#[serde(with = "ts_milliseconds")]
	fetch_time: DateTime<Utc>,
	#[serde(default)]
	experiments: Vec<ExperimentDescriptor>,
	#[serde(default)]
	personalization: BTreeMap<String, PersonalizationMetadata>,
	#[serde(default)]
	template_version: u64,
}
impl Container {
	/// Start building a new container.
	pub fn builder() -> ContainerBuilder {
		ContainerBuilder::default()
	}

	/// Parameter key to raw string value mapping.
	pub fn configs(&self) -> &BTreeMap<String, String> {
		&self.configs
	}

	/// Raw string value for a parameter key, when present.
	pub fn get(&self, key: &str) -> Option<&str> {
		self.configs.get(key).map(String::as_str)
	}

	/// When the snapshot was fetched; the Unix epoch marks developer defaults.
	pub fn fetch_time(&self) -> DateTime<Utc> {
		self.fetch_time
	}

	/// Ordered experiment descriptors shipped with the snapshot.
	pub fn experiments(&self) -> &[ExperimentDescriptor] {
		&self.experiments
	}

	/// Personalization metadata for a parameter key, when present.
	pub fn personalization_for(&self, key: &str) -> Option<&PersonalizationMetadata> {
		self.personalization.get(key)
	}

	/// Personalization metadata keyed by parameter.
	pub fn personalization(&self) -> &BTreeMap<String, PersonalizationMetadata> {
		&self.personalization
	}

	/// Server-side template version; zero means unknown.
	pub fn template_version(&self) -> u64 {
		self.template_version
	}
}

/// Builder producing immutable [`Container`] values.
#[derive(Clone, Debug, Default)]
pub struct ContainerBuilder {
	configs: BTreeMap<String, String>,
	fetch_time: Option<DateTime<Utc>>,
	experiments: Vec<ExperimentDescriptor>,
	personalization: BTreeMap<String, PersonalizationMetadata>,
	template_version: u64,
}
impl ContainerBuilder {
	/// Replace the parameter map.
	pub fn configs(mut self, configs: BTreeMap<String, String>) -> Self {
		self.configs = configs;

		self
	}

	/// Insert a single parameter entry.
	pub fn config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.configs.insert(key.into(), value.into());

		self
	}

	/// Set the fetch timestamp; defaults to the Unix epoch when unset.
	pub fn fetch_time(mut self, fetch_time: DateTime<Utc>) -> Self {
		self.fetch_time = Some(fetch_time);

		self
	}

	/// Replace the experiment descriptors.
	pub fn experiments(mut self, experiments: Vec<ExperimentDescriptor>) -> Self {
		self.experiments = experiments;

		self
	}

	/// Replace the personalization metadata map.
	pub fn personalization(
		mut self,
		personalization: BTreeMap<String, PersonalizationMetadata>,
	) -> Self {
		self.personalization = personalization;

		self
	}

	/// Set the server-side template version.
	pub fn template_version(mut self, template_version: u64) -> Self {
		self.template_version = template_version;

		self
	}

	/// Finalize into an immutable container.
	pub fn build(self) -> Container {
		Container {
			configs: self.configs,
			fetch_time: self.fetch_time.unwrap_or(DateTime::UNIX_EPOCH),
			experiments: self.experiments,
			personalization: self.personalization,
			template_version: self.template_version,
		}
	}
}
