//! Integration tests for activation, layered lookups, and rollouts publish.

// std
use std::{
	collections::BTreeSet,
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use remote_config::{RolloutsState, RolloutsStateSubscriber};
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::{
	Mock, MockServer, Request, ResponseTemplate,
	matchers::{method, path},
};
// self
use crate::support::{FETCH_PATH, engine_for, init_tracing};

struct ChannelSubscriber(mpsc::UnboundedSender<RolloutsState>);
impl RolloutsStateSubscriber for ChannelSubscriber {
	fn on_rollouts_state(&self, state: RolloutsState) {
		let _ = self.0.send(state);
	}
}

#[tokio::test]
async fn lookups_layer_activated_over_defaults_over_static() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"state": "UPDATE",
			"entries": {"greeting": "hello"}
		})))
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());

	engine
		.set_defaults(
			[
				("greeting".to_string(), "hi".to_string()),
				("lang".to_string(), "en".to_string()),
			]
			.into_iter()
			.collect(),
		)
		.await
		.expect("defaults");

	assert!(engine.fetch_and_activate().await.expect("fetch and activate"));
	assert_eq!(engine.get_string("greeting").await, "hello");
	assert_eq!(engine.get_string("lang").await, "en");
	assert_eq!(engine.get_string("missing").await, "");
}

#[tokio::test]
async fn activation_publishes_the_diff_to_subscribers() {
	init_tracing();

	let server = MockServer::start().await;
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = calls.clone();

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.respond_with(move |_: &Request| match counter.fetch_add(1, Ordering::SeqCst) {
			0 => ResponseTemplate::new(200).set_body_json(json!({
				"state": "UPDATE",
				"entries": {"a": "1", "b": "2"}
			})),
			_ => ResponseTemplate::new(200).set_body_json(json!({
				"state": "UPDATE",
				"entries": {"a": "1", "b": "3", "c": "4"}
			})),
		})
		.expect(2)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());

	assert!(engine.fetch_and_activate().await.expect("first activation"));

	let (tx, mut rx) = mpsc::unbounded_channel();

	engine.add_rollouts_subscriber(Arc::new(ChannelSubscriber(tx))).await;

	// Registration publishes one synthetic state covering every key.
	let synthetic = tokio::time::timeout(Duration::from_secs(1), rx.recv())
		.await
		.expect("synthetic state")
		.expect("open channel");

	assert_eq!(synthetic.changed_keys, BTreeSet::from(["a".to_string(), "b".to_string()]));

	// The second snapshot must be strictly newer than the first.
	tokio::time::sleep(Duration::from_millis(5)).await;

	assert!(engine.fetch_and_activate().await.expect("second activation"));

	let state = tokio::time::timeout(Duration::from_secs(1), rx.recv())
		.await
		.expect("activation state")
		.expect("open channel");

	assert_eq!(state.changed_keys, BTreeSet::from(["b".to_string(), "c".to_string()]));
	assert_eq!(state.container.get("c"), Some("4"));

	server.verify().await;
}

#[tokio::test]
async fn activating_twice_without_a_new_fetch_is_a_no_op() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"state": "UPDATE",
			"entries": {"greeting": "hello"}
		})))
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());

	assert!(engine.fetch_and_activate().await.expect("fetch and activate"));
	// The fetched slot was consumed by the first activation.
	assert!(!engine.activate().await.expect("activate"));
}
