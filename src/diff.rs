//! Computes the set of parameter keys that changed between two containers.

// std
use std::collections::{BTreeMap, BTreeSet};
// self
use crate::container::{Container, ExperimentDescriptor};

/// Parameter keys that differ between `a` and `b`.
///
/// A key is reported when its value is present on only one side, the string
/// values differ, the personalization metadata for the key differs, or an
/// experiment naming the key as affected was added, removed, or changed.
pub fn changed_params(a: &Container, b: &Container) -> BTreeSet<String> {
	let mut changed = BTreeSet::new();

	for key in a.configs().keys().chain(b.configs().keys()) {
		match (a.get(key), b.get(key)) {
			(Some(left), Some(right)) if left == right => {
				if a.personalization_for(key) != b.personalization_for(key) {
					changed.insert(key.clone());
				}
			},
			_ => {
				changed.insert(key.clone());
			},
		}
	}

	let left = experiments_by_id(a);
	let right = experiments_by_id(b);

	for id in left.keys().chain(right.keys()) {
		match (left.get(id.as_str()), right.get(id.as_str())) {
			(Some(before), Some(after)) =>
				if before.without_affected_keys() == after.without_affected_keys() {
					// Equal experiments still flag keys scoped on one side only.
					let before_keys: BTreeSet<_> =
						before.affected_parameter_keys.iter().collect();
					let after_keys: BTreeSet<_> = after.affected_parameter_keys.iter().collect();

					changed.extend(
						before_keys.symmetric_difference(&after_keys).map(|key| (*key).clone()),
					);
				} else {
					changed.extend(before.affected_parameter_keys.iter().cloned());
					changed.extend(after.affected_parameter_keys.iter().cloned());
				},
			(Some(only), None) | (None, Some(only)) => {
				changed.extend(only.affected_parameter_keys.iter().cloned());
			},
			(None, None) => unreachable!("id drawn from one of the two maps"),
		}
	}

	changed
}

fn experiments_by_id(container: &Container) -> BTreeMap<String, &ExperimentDescriptor> {
	container
		.experiments()
		.iter()
		.map(|descriptor| (descriptor.experiment_id.clone(), descriptor))
		.collect()
}
