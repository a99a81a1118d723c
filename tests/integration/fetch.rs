//! Integration tests for fetch decisions, throttling, and bookkeeping.

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use chrono::Utc;
use remote_config::{Error, FetchOutcome, FetchStatus};
use serde_json::json;
use wiremock::{
	Mock, MockServer, Request, ResponseTemplate,
	matchers::{body_partial_json, header, method, path},
};
// self
use crate::support::{FETCH_PATH, engine_for, init_tracing};

#[tokio::test]
async fn successful_fetch_stores_container_and_revalidates_with_etag() {
	init_tracing();

	let server = MockServer::start().await;
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = calls.clone();

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.and(header("X-Goog-Api-Key", "key"))
		.and(header("X-Goog-Firebase-Installations-Auth", "installation-token"))
		.and(header("X-Google-GFE-Can-Retry", "yes"))
		.respond_with(move |request: &Request| {
			match counter.fetch_add(1, Ordering::SeqCst) {
				0 => {
					assert!(
						!request.headers.contains_key("if-none-match"),
						"no etag known before the first fetch"
					);

					ResponseTemplate::new(200)
						.insert_header("etag", "etag-1")
						.set_body_json(json!({
							"state": "UPDATE",
							"entries": {"greeting": "hello"},
							"templateVersion": 5
						}))
				},
				_ => {
					assert_eq!(
						request.headers.get("if-none-match").map(|value| value.as_bytes()),
						Some(b"etag-1".as_slice()),
						"second fetch must revalidate with the stored etag"
					);

					ResponseTemplate::new(200)
						.insert_header("etag", "etag-1")
						.set_body_json(json!({"state": "NO_CHANGE"}))
				},
			}
		})
		.expect(2)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());
	let first = engine.fetch_with_interval(Duration::ZERO).await.expect("first fetch");

	assert_eq!(first.outcome, FetchOutcome::BackendUpdatesFetched);
	assert_eq!(first.etag.as_deref(), Some("etag-1"));
	assert_eq!(first.container.expect("container").get("greeting"), Some("hello"));
	assert_eq!(engine.last_fetch_status(), FetchStatus::Success);
	assert!(engine.last_successful_fetch_time().is_some());

	let second = engine.fetch_with_interval(Duration::ZERO).await.expect("second fetch");

	assert_eq!(second.outcome, FetchOutcome::BackendHasNoUpdates);
	assert!(second.container.is_none());

	server.verify().await;
}

#[tokio::test]
async fn second_consecutive_503_throttles_with_a_jittered_window() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.respond_with(ResponseTemplate::new(503))
		.expect(2)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());

	match engine.fetch_with_interval(Duration::ZERO).await {
		Err(Error::Server { status }) => assert_eq!(status.as_u16(), 503),
		other => panic!("first 503 should surface as a server error, got {other:?}"),
	}
	assert_eq!(engine.last_fetch_status(), FetchStatus::Failure);

	let before = Utc::now();

	match engine.fetch_with_interval(Duration::ZERO).await {
		Err(Error::Throttled { until }) => {
			let window = (until - before).num_milliseconds();

			// Two failures land in the four-minute band: [2 min, 6 min).
			assert!(window >= 2 * 60 * 1_000, "window {window} ms too short");
			assert!(window < 6 * 60 * 1_000, "window {window} ms too long");
		},
		other => panic!("second 503 should throttle, got {other:?}"),
	}
	assert_eq!(engine.last_fetch_status(), FetchStatus::Throttled);

	// The window is now closed; a third fetch fails without touching the
	// backend (the mock expects exactly two requests).
	assert!(matches!(
		engine.fetch_with_interval(Duration::ZERO).await,
		Err(Error::Throttled { .. })
	));

	server.verify().await;
}

#[tokio::test]
async fn rate_limit_responses_throttle_immediately() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.respond_with(ResponseTemplate::new(429))
		.expect(1)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());

	assert!(matches!(
		engine.fetch_with_interval(Duration::ZERO).await,
		Err(Error::Throttled { .. })
	));
	assert_eq!(engine.last_fetch_status(), FetchStatus::Throttled);

	server.verify().await;
}

#[tokio::test]
async fn auth_errors_surface_without_touching_backoff() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.respond_with(ResponseTemplate::new(401))
		.expect(2)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());

	// Two 401s in a row both reach the backend; no backoff window closes.
	for _ in 0..2 {
		match engine.fetch_with_interval(Duration::ZERO).await {
			Err(Error::Server { status }) => assert_eq!(status.as_u16(), 401),
			other => panic!("expected a server error, got {other:?}"),
		}
	}

	server.verify().await;
}

#[tokio::test]
async fn fresh_container_satisfies_fetch_locally() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"state": "UPDATE",
			"entries": {"greeting": "hello"}
		})))
		.expect(1)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());
	let interval = Duration::from_secs(43_200);
	let first = engine.fetch_with_interval(interval).await.expect("first fetch");

	assert_eq!(first.outcome, FetchOutcome::BackendUpdatesFetched);

	// Well inside the 12-hour window the cached container is still fresh;
	// the mock expects exactly one request.
	let second = engine.fetch_with_interval(interval).await.expect("second fetch");

	assert_eq!(second.outcome, FetchOutcome::LocalStorageUsed);

	server.verify().await;
}

#[tokio::test]
async fn custom_signals_and_identity_ride_the_request_body() {
	init_tracing();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(FETCH_PATH))
		.and(body_partial_json(json!({
			"app_instance_id": "installation-id",
			"app_instance_id_token": "installation-token",
			"app_id": "app",
			"custom_signals": {"tier": "beta"}
		})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "NO_CHANGE"})))
		.expect(1)
		.mount(&server)
		.await;

	let dir = tempfile::tempdir().expect("tempdir");
	let engine = engine_for(&server, dir.path());

	assert!(engine.set_custom_signals(
		[("tier".to_string(), Some("beta".to_string()))].into_iter().collect()
	));

	let result = engine.fetch_with_interval(Duration::ZERO).await.expect("fetch");

	assert_eq!(result.outcome, FetchOutcome::BackendHasNoUpdates);

	server.verify().await;
}
