mod common;

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::test_helpers::{empty, json, with_headers, ScriptedTransport};
use discord_dispatch::{
    ApiRequest, Attachment, DispatchError, DispatchLayer, Dispatcher, DispatcherConfig,
    InstantSleeper, Params, Resource, TokenBucket, TrackingSleeper,
};
use http::StatusCode;
use serde_json::json as j;
use tokio::time::Instant;
use tower::{Service, ServiceBuilder, ServiceExt};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

const BASE: &str = "https://discord.test/api/v10";

fn config() -> DispatcherConfig {
    DispatcherConfig::builder()
        .token("abc.def.ghi")
        .base_uri(BASE)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap()
}

fn get_channel(id: u64) -> ApiRequest {
    ApiRequest::new("GET", "/channels/{channel_id}").param("channel_id", id)
}

fn channel_resource(id: u64) -> Resource {
    let mut params = Params::new();
    params.insert("channel_id".into(), id.to_string());
    Resource::new(BASE, "GET", "/channels/{channel_id}", &params).unwrap()
}

#[tokio::test(start_paused = true)]
async fn global_429_suspends_then_succeeds() {
    let transport = ScriptedTransport::new([
        json(
            429,
            j!({"retry_after": 500, "global": true, "message": "You are being rate limited."}),
        ),
        json(200, j!({"id": "1"})),
    ]);
    let dispatcher = Dispatcher::new(transport.clone(), config());
    let start = Instant::now();

    let response = dispatcher.request(get_channel(1)).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_json(), Some(&j!({"id": "1"})));
    assert_eq!(transport.calls(), 2);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(500), "{waited:?}");
    assert!(waited < Duration::from_millis(600), "{waited:?}");
    assert!(!dispatcher.latch().is_locked());
}

#[tokio::test(start_paused = true)]
async fn global_header_locks_the_latch() {
    let transport = ScriptedTransport::new([
        with_headers(json(429, j!({"retry_after": 500})), &[("X-RateLimit-Global", "true")]),
        json(200, j!({})),
    ]);
    let dispatcher = Dispatcher::new(transport.clone(), config());

    let call = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.request(get_channel(1)).await })
    };
    while transport.calls() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(dispatcher.latch().is_locked());

    call.await.unwrap().unwrap();
    let sent = transport.requests();
    assert_eq!(sent.len(), 2);
    let waited = sent[1].at - sent[0].at;
    assert!(waited >= Duration::from_millis(500), "{waited:?}");
    assert!(waited < Duration::from_millis(600), "{waited:?}");
    assert!(!dispatcher.latch().is_locked());
}

#[tokio::test(start_paused = true)]
async fn oversized_global_retry_after_falls_back_to_backoff() {
    let sleeper = TrackingSleeper::new();
    let config = DispatcherConfig::builder()
        .base_uri(BASE)
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap();
    let transport = ScriptedTransport::new([
        json(429, j!({"retry_after": 1e300, "global": true})),
        json(200, j!({})),
    ]);
    let dispatcher = Dispatcher::new(transport.clone(), config);

    dispatcher.request(get_channel(1)).await.unwrap();

    assert!(!dispatcher.latch().is_locked());
    assert_eq!(transport.calls(), 2);
    assert_eq!(sleeper.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn oversized_retry_after_header_falls_back_to_backoff() {
    let sleeper = TrackingSleeper::new();
    let config = DispatcherConfig::builder()
        .base_uri(BASE)
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap();
    let transport = ScriptedTransport::new([
        with_headers(empty(429), &[("Retry-After", "1e300")]),
        with_headers(empty(429), &[("Retry-After", "1e16")]),
        json(200, j!({})),
    ]);
    let dispatcher = Dispatcher::new(transport.clone(), config);

    dispatcher.request(get_channel(1)).await.unwrap();

    assert_eq!(transport.calls(), 3);
    assert_eq!(sleeper.calls().len(), 2);
    let bucket = dispatcher.bucket_for(&channel_resource(1)).unwrap();
    assert!(!bucket.is_limiting());
}

#[tokio::test(start_paused = true)]
async fn global_lock_holds_other_routes_too() {
    let transport = ScriptedTransport::new([
        json(429, j!({"retry_after": 1000, "global": true})),
        json(200, j!({})),
        json(200, j!({})),
    ]);
    let dispatcher = Dispatcher::new(transport.clone(), config());

    let first = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.request(get_channel(1)).await })
    };
    while !dispatcher.latch().is_locked() {
        tokio::task::yield_now().await;
    }
    let start = Instant::now();
    dispatcher.request(get_channel(2)).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(900));
    first.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_bucket_is_marked_limiting() {
    let transport = ScriptedTransport::new([
        with_headers(
            json(200, j!({})),
            &[
                ("Date", "Tue, 01 Jan 2019 00:00:00 GMT"),
                ("X-RateLimit-Limit", "10"),
                ("X-RateLimit-Remaining", "0"),
                ("X-RateLimit-Reset", "1546300805"),
            ],
        ),
        json(200, j!({})),
    ]);
    let dispatcher = Dispatcher::new(transport.clone(), config());

    dispatcher.request(get_channel(7)).await.unwrap();
    let bucket = dispatcher.bucket_for(&channel_resource(7)).expect("bucket was created");
    assert!(bucket.is_limiting());
    assert_eq!(bucket.capacity(), 10);
    assert_eq!(bucket.window(), Duration::from_secs(5));

    let start = Instant::now();
    dispatcher.request(get_channel(7)).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn not_found_carries_the_discord_error() {
    let transport =
        ScriptedTransport::new([json(404, j!({"code": 10003, "message": "Unknown Channel"}))]);
    let dispatcher = Dispatcher::new(transport.clone(), config());

    let err = dispatcher.request(get_channel(3)).await.unwrap_err();

    assert!(err.is_not_found());
    assert!(err.is_client_error());
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(err.code(), Some(10003));
    assert_eq!(err.message(), Some("Unknown Channel"));
    assert_eq!(err.to_string(), "Not Found: (10003) Unknown Channel");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn bare_429s_exhaust_retries_with_backoff() {
    let sleeper = TrackingSleeper::new();
    let config = DispatcherConfig::builder()
        .base_uri(BASE)
        .max_retries(3)
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap();
    let transport = ScriptedTransport::repeating(empty(429));
    let dispatcher = Dispatcher::new(transport.clone(), config);

    let err = dispatcher.request(get_channel(9)).await.unwrap_err();

    match &err {
        DispatchError::RetriesExhausted { attempts, resource } => {
            assert_eq!(*attempts, 3);
            assert_eq!(resource.bucket_key(), channel_resource(9).bucket_key());
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(transport.calls(), 3);

    let delays = sleeper.calls();
    assert_eq!(delays.len(), 2);
    assert!(delays[0] >= Duration::from_secs(1) && delays[0] <= Duration::from_secs(2));
    assert!(delays[1] >= Duration::from_secs(2) && delays[1] <= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn local_429_with_retry_after_waits_on_the_bucket() {
    let sleeper = TrackingSleeper::new();
    let config = DispatcherConfig::builder()
        .base_uri(BASE)
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap();
    let transport = ScriptedTransport::new([
        with_headers(empty(429), &[("Retry-After", "1500")]),
        json(200, j!({})),
    ]);
    let dispatcher = Dispatcher::new(transport.clone(), config);
    let start = Instant::now();

    dispatcher.request(get_channel(4)).await.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(1500));
    assert_eq!(transport.calls(), 2);
    assert!(sleeper.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_not_retried() {
    let mut page = empty(502);
    page.headers.insert(http::header::CONTENT_TYPE, "text/html".parse().unwrap());
    page.body = b"<h1>Bad Gateway</h1>".to_vec();
    let transport = ScriptedTransport::new([page]);
    let dispatcher = Dispatcher::new(transport.clone(), config());

    let err = dispatcher.request(get_channel(5)).await.unwrap_err();

    assert!(err.is_server_error());
    assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
    assert_eq!(err.message(), Some("<h1>Bad Gateway</h1>"));
    assert_eq!(err.code(), None);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn plain_text_server_error_keeps_the_text() {
    let mut page = empty(503);
    page.headers.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());
    page.body = b"upstream connect error".to_vec();
    let dispatcher = Dispatcher::new(ScriptedTransport::new([page]), config());

    let err = dispatcher.request(get_channel(5)).await.unwrap_err();

    assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(err.message(), Some("upstream connect error"));
}

#[tokio::test(start_paused = true)]
async fn empty_server_error_uses_the_status_phrase() {
    let dispatcher = Dispatcher::new(ScriptedTransport::new([empty(504)]), config());

    let err = dispatcher.request(get_channel(5)).await.unwrap_err();
    assert_eq!(err.message(), Some("Gateway Timeout"));
}

#[tokio::test(start_paused = true)]
async fn unknown_status_is_rejected() {
    let transport = ScriptedTransport::new([empty(669)]);
    let dispatcher = Dispatcher::new(transport, config());

    let err = dispatcher.request(get_channel(5)).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnrecognizedStatus(669)));
}

#[tokio::test(start_paused = true)]
async fn invalid_route_fails_before_sending() {
    let transport = ScriptedTransport::default();
    let dispatcher = Dispatcher::new(transport.clone(), config());

    let err = dispatcher
        .request(
            ApiRequest::new("GET", "/guilds/{guild_id}/members/{user_id}").param("guild_id", 1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Route(_)));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn sends_default_headers_body_and_audit_reason() {
    let transport = ScriptedTransport::new([empty(204)]);
    let dispatcher = Dispatcher::new(transport.clone(), config());

    let response = dispatcher
        .request(
            ApiRequest::new("post", "/channels/{channel_id}/messages")
                .param("channel_id", 42)
                .json(j!({"content": "hello"}))
                .reason("cleanup"),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    let sent = &transport.requests()[0];
    assert_eq!(sent.method, http::Method::POST);
    assert_eq!(sent.uri, format!("{BASE}/channels/42/messages"));
    assert_eq!(sent.json, Some(j!({"content": "hello"})));
    assert_eq!(sent.headers["authorization"], "Bot abc.def.ghi");
    assert_eq!(sent.headers["x-ratelimit-precision"], "millisecond");
    assert_eq!(sent.headers["x-audit-log-reason"], "cleanup");
    assert!(sent.headers["user-agent"].to_str().unwrap().starts_with("DiscordBot ("));
}

#[tokio::test(start_paused = true)]
async fn attachments_are_resent_in_full_after_a_retry() {
    let transport = ScriptedTransport::new([empty(429), json(200, j!({"id": "9"}))]);
    let dispatcher = Dispatcher::new(transport.clone(), config());

    dispatcher
        .request(
            ApiRequest::new("POST", "/channels/{channel_id}/messages")
                .param("channel_id", 1)
                .attachment(Attachment::new("hello.txt", Cursor::new(b"hello".to_vec()))),
        )
        .await
        .unwrap();

    let sent = transport.requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].files, vec![b"hello".to_vec()]);
    assert_eq!(sent[1].files, vec![b"hello".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn max_retries_can_be_lowered_live() {
    let transport = ScriptedTransport::repeating(empty(429));
    let dispatcher = Dispatcher::new(transport.clone(), config());

    dispatcher.config().max_retries().set(1);
    let err = dispatcher.request(get_channel(1)).await.unwrap_err();

    assert!(err.is_retries_exhausted());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn layer_wraps_a_transport() {
    let transport = ScriptedTransport::new([json(200, j!({"ok": true}))]);
    let mut svc = ServiceBuilder::new().layer(DispatchLayer::new(config())).service(transport);

    let response = svc.ready().await.unwrap().call(get_channel(1)).await.unwrap();
    assert_eq!(response.body.as_json(), Some(&j!({"ok": true})));
}

#[tokio::test(start_paused = true)]
async fn close_rejects_queued_and_new_calls() {
    let transport = ScriptedTransport::new([
        with_headers(
            json(200, j!({})),
            &[
                ("Date", "Tue, 01 Jan 2019 00:00:00 GMT"),
                ("X-RateLimit-Limit", "1"),
                ("X-RateLimit-Remaining", "0"),
                ("X-RateLimit-Reset", "1546300860"),
            ],
        ),
    ]);
    let dispatcher = Dispatcher::new(transport.clone(), config());
    dispatcher.request(get_channel(1)).await.unwrap();
    let bucket = dispatcher.bucket_for(&channel_resource(1)).unwrap();
    assert!(bucket.is_limiting());

    let queued = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.request(get_channel(1)).await })
    };
    while bucket.pending() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(dispatcher.close(), 1);
    assert!(matches!(queued.await.unwrap(), Err(DispatchError::Closed)));
    assert!(matches!(dispatcher.request(get_channel(2)).await, Err(DispatchError::Closed)));

    let mut svc = dispatcher.clone();
    assert!(matches!(svc.ready().await, Err(DispatchError::Closed)));
    assert_eq!(transport.calls(), 1);
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limits_are_logged() {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_max_level(tracing::Level::DEBUG)
        .without_time()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let transport = ScriptedTransport::new([
        json(429, j!({"retry_after": 250, "global": true})),
        empty(429),
        json(200, j!({})),
    ]);
    let dispatcher = Dispatcher::new(transport, config());
    dispatcher.request(get_channel(1)).await.unwrap();

    let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("global rate limit has been reached"), "{logs}");
    assert!(logs.contains("backing off"), "{logs}");
}
