//! Shared exponential-backoff schedule for fetch and realtime retries.

// std
use std::cell::RefCell;
// crates.io
use chrono::TimeDelta;
use rand::{Rng, SeedableRng, rngs::SmallRng};
// self
use crate::{_prelude::*, storage::metadata::BackoffMetadata};

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Backoff base durations, in minutes, indexed by consecutive-failure count.
/// Failures beyond the table reuse the last entry.
pub const BACKOFF_MINUTES: [u64; 8] = [2, 4, 8, 16, 32, 64, 128, 256];

/// Record one more consecutive failure observed at `failure_time` and compute
/// the next backoff window.
///
/// The window length is drawn uniformly from `[base/2, base*3/2)` where
/// `base` comes from [`BACKOFF_MINUTES`].
pub fn advance(previous: BackoffMetadata, failure_time: DateTime<Utc>) -> BackoffMetadata {
	let num_failures = previous.num_failures.saturating_add(1);
	let index = (num_failures as usize).min(BACKOFF_MINUTES.len()) - 1;
	let base_millis = BACKOFF_MINUTES[index] * 60 * 1_000;
	let duration_millis = random_in_range(base_millis / 2, base_millis + base_millis / 2);

	BackoffMetadata {
		num_failures,
		backoff_end: Some(failure_time + TimeDelta::milliseconds(duration_millis as i64)),
	}
}

/// Uniformly-random integer number of seconds in `[0, upper)`.
pub fn random_delay_secs(upper: u64) -> u64 {
	random_in_range(0, upper)
}

fn random_in_range(lower: u64, upper: u64) -> u64 {
	SMALL_RNG.with(|cell| cell.borrow_mut().random_range(lower..upper))
}
