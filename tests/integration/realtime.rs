//! Integration tests for the realtime stream and autofetch pathway.

// std
use std::time::Duration;
// crates.io
use serde_json::json;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_partial_json, header, method, path},
};
// self
use crate::support::{ChannelListener, FETCH_PATH, STREAM_PATH, engine_for, init_tracing};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_announcement_triggers_autofetch_and_one_notification() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(STREAM_PATH))
		.and(header("X-Accept-Response-Streaming", "true"))
		.and(body_partial_json(json!({
			"project": "42",
			"namespace": "firebase",
			"lastKnownVersionNumber": 0
		})))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_string("{\"latestTemplateVersionNumber\": 9}\n"),
		)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"state": "UPDATE",
			"entries": {"greeting": "hello"},
			"templateVersion": 9
		})))
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());
	let (listener, mut updates, _errors) = ChannelListener::channels();
	let handle = engine.add_update_listener(listener);

	// The announcement arrives, autofetch jitters up to four seconds, then
	// the fetched version satisfies the target.
	let update = tokio::time::timeout(Duration::from_secs(15), updates.recv())
		.await
		.expect("update within the autofetch budget")
		.expect("open channel");

	assert!(update.updated_keys.contains("greeting"), "got {:?}", update.updated_keys);

	// Exactly one notification per announcement.
	tokio::time::sleep(Duration::from_millis(300)).await;

	assert!(updates.try_recv().is_err());

	handle.remove();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feature_disabled_quiesces_the_stream_without_reconnect() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(STREAM_PATH))
		.respond_with(
			ResponseTemplate::new(200).set_body_string("{\"featureDisabled\": true}\n"),
		)
		.expect(1)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());
	let (listener, _updates, mut errors) = ChannelListener::channels();
	let _handle = engine.add_update_listener(listener);
	let error = tokio::time::timeout(Duration::from_secs(5), errors.recv())
		.await
		.expect("unavailable error")
		.expect("open channel");

	assert!(error.contains("disabled"), "unexpected error: {error}");

	// The task exits for good; no reconnect is ever attempted.
	tokio::time::sleep(Duration::from_millis(500)).await;

	assert!(!engine.is_streaming());
	assert!(errors.try_recv().is_err(), "the unavailable error is delivered once");

	server.verify().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_runs_exactly_while_listeners_are_registered() {
	init_tracing();

	let server = MockServer::start().await;

	// Keep the connection attempt in flight so the task stays alive.
	Mock::given(method("POST"))
		.and(path(STREAM_PATH))
		.respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(60)))
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());

	assert!(!engine.is_streaming());

	let (listener, _updates, _errors) = ChannelListener::channels();
	let handle = engine.add_update_listener(listener);

	assert!(engine.is_streaming());

	handle.remove();

	// Cancellation lands at the next await point.
	for _ in 0..20 {
		if !engine.is_streaming() {
			break;
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	assert!(!engine.is_streaming());
}
