//! Integration tests for the client: calls, redirects, timeouts and
//! notifications against mock data centers.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::{config, dead_endpoint, MockDc, MockOptions, ROTATED_SALT};
use dc_session::wire::frame::MAX_FRAME_LEN;
use dc_session::{ApiClient, DcId, KeyStore, MemoryKeyStore, Outcome, RpcError, TransportError, WireError};

fn success(text: &str) -> Outcome {
    Outcome::Success(Bytes::copy_from_slice(text.as_bytes()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![server.endpoint()])).unwrap();

    assert!(!client.sessions().is_authenticated(DcId(1)));
    assert_eq!(client.call("echo:hello").await, success("hello"));
    assert_eq!(client.call("echo:again").await, success("again"));

    assert!(client.sessions().is_authenticated(DcId(1)));
    assert_eq!(server.handshakes(), 1);
    assert_eq!(client.pending_requests(), 0);

    // Only the first request on a connection carries the app info
    assert_eq!(server.requests(), vec![Bytes::from("echo:hello"), Bytes::from("echo:again")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_seed_then_reachable() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![dead_endpoint(DcId(1)), server.endpoint()])).unwrap();

    assert_eq!(client.call("echo:ok").await, success("ok"));
    assert!(client.sessions().get_auth_key(DcId(1)).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_call_queued_behind_handshake() {
    let server = MockDc::start_with(
        DcId(1),
        MockOptions {
            handshake_delay: Duration::from_millis(300),
            ..MockOptions::default()
        },
    )
    .await;
    let client = Arc::new(ApiClient::new(config(vec![server.endpoint()])).unwrap());

    let authorizing = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.authorize(DcId(1)).await })
    };
    // Let the handshake start first
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.sessions().is_authenticated(DcId(1)));

    let calls: Vec<_> = (0..4)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call(format!("echo:{}", i)).await })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), success(&i.to_string()));
    }
    let resolved_at = std::time::Instant::now();

    authorizing.await.unwrap().unwrap();
    let handshake_done = server.handshake_done_at().expect("handshake completed");
    assert!(resolved_at >= handshake_done);
    assert_eq!(server.handshakes(), 1, "concurrent callers share one handshake");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redirect_is_followed_once() {
    let dc1 = MockDc::start(DcId(1)).await;
    let dc2 = MockDc::start(DcId(2)).await;
    let client = ApiClient::new(config(vec![dc1.endpoint(), dc2.endpoint()])).unwrap();

    assert_eq!(client.call("migrate:2").await, success("here:2"));
    assert_eq!(client.sessions().primary_dc(), DcId(2));
    assert_eq!(dc2.handshakes(), 1);

    // New calls go to the new primary directly
    assert_eq!(client.call("echo:direct").await, success("direct"));
    assert_eq!(dc2.requests().last().unwrap(), &Bytes::from("echo:direct"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_redirect_is_surfaced() {
    let dc1 = MockDc::start(DcId(1)).await;
    let dc2 = MockDc::start(DcId(2)).await;
    let client = ApiClient::new(config(vec![dc1.endpoint(), dc2.endpoint()])).unwrap();

    assert_eq!(client.call("moved:2").await, Outcome::Error(RpcError::Moved(DcId(2))));
    assert_eq!(dc1.requests().len(), 1);
    assert_eq!(dc2.requests().len(), 1);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redirect_to_unknown_dc() {
    let dc1 = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![dc1.endpoint()])).unwrap();

    assert_eq!(client.call("moved:9").await, Outcome::Error(RpcError::Moved(DcId(9))));
    assert_eq!(client.sessions().primary_dc(), DcId(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unanswered_call_times_out_within_bound() {
    let server = MockDc::start(DcId(1)).await;
    let mut cfg = config(vec![server.endpoint()]);
    cfg.request_timeout_ms = 400;
    cfg.sweep_interval_ms = 50;
    let client = ApiClient::new(cfg).unwrap();
    client.authorize(DcId(1)).await.unwrap();

    let started = std::time::Instant::now();
    let outcome = client.call("silent").await;
    let elapsed = started.elapsed();

    assert_eq!(outcome, Outcome::Timeout);
    assert!(elapsed >= Duration::from_millis(400), "resolved early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400 + 50 + 400), "resolved late: {:?}", elapsed);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_call_times_out_while_reconnecting() {
    let server = MockDc::start(DcId(1)).await;
    let mut cfg = config(vec![server.endpoint()]);
    cfg.request_timeout_ms = 300;
    cfg.sweep_interval_ms = 50;
    cfg.reconnect_base_delay_ms = 1_000;
    let client = ApiClient::new(cfg).unwrap();
    client.authorize(DcId(1)).await.unwrap();

    // The server closes the socket and stops accepting
    let started = std::time::Instant::now();
    let outcome = client.call("vanish").await;
    let elapsed = started.elapsed();

    assert_eq!(outcome, Outcome::Timeout);
    assert!(elapsed >= Duration::from_millis(300), "resolved early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300 + 50 + 400), "resolved late: {:?}", elapsed);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_resolve_exactly_once() {
    let server = MockDc::start(DcId(1)).await;
    let client = Arc::new(ApiClient::new(config(vec![server.endpoint()])).unwrap());
    client.authorize(DcId(1)).await.unwrap();

    let calls: Vec<_> = (0..32)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { (i, client.call(format!("echo:{}", i)).await) })
        })
        .collect();
    for call in calls {
        let (i, outcome) = call.await.unwrap();
        assert_eq!(outcome, success(&i.to_string()));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_pending_call() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![server.endpoint()])).unwrap();

    let handle = client.send("silent").await.unwrap();
    assert!(client.cancel(handle.call_id()));
    assert!(!client.cancel(handle.call_id()));
    assert_eq!(handle.await, Outcome::Error(RpcError::Cancelled));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_redirect() {
    let dc1 = MockDc::start(DcId(1)).await;
    let dc2 = MockDc::start_with(
        DcId(2),
        MockOptions {
            handshake_delay: Duration::from_millis(500),
            ..MockOptions::default()
        },
    )
    .await;
    let client = ApiClient::new(config(vec![dc1.endpoint(), dc2.endpoint()])).unwrap();
    client.authorize(DcId(1)).await.unwrap();

    let handle = client.send("migrate:2").await.unwrap();
    // Redirected by now, waiting for the handshake with DC 2
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(dc2.handshakes(), 0);
    assert!(client.cancel(handle.call_id()));
    assert!(!client.cancel(handle.call_id()));
    assert_eq!(handle.await, Outcome::Error(RpcError::Cancelled));

    let handshake = tokio::time::timeout(Duration::from_secs(20), async {
        while dc2.handshakes() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(handshake.is_ok(), "DC 2 handshake never finished");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The cancelled call is never delivered to the new primary
    assert!(dc2.requests().is_empty());
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_request_keeps_connection() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![server.endpoint()])).unwrap();
    assert_eq!(client.call("echo:before").await, success("before"));

    let outcome = client.call(Bytes::from(vec![b'x'; MAX_FRAME_LEN])).await;
    assert!(
        matches!(
            outcome,
            Outcome::Error(RpcError::Transport(TransportError::Wire(WireError::FrameTooLarge(_))))
        ),
        "unexpected outcome: {:?}",
        outcome
    );
    assert!(client.is_connected(DcId(1)));
    assert_eq!(client.pending_requests(), 0);

    assert_eq!(client.call("echo:after").await, success("after"));
    assert_eq!(server.requests(), vec![Bytes::from("echo:before"), Bytes::from("echo:after")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_error_is_delivered() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![server.endpoint()])).unwrap();

    assert_eq!(
        client.call("fail").await,
        Outcome::Error(RpcError::ServerError {
            code: 400,
            message: "BAD_REQUEST".to_string(),
        })
    );
    assert!(client.sessions().is_authenticated(DcId(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revoked_authorization() {
    let server = MockDc::start(DcId(1)).await;
    let store = Arc::new(MemoryKeyStore::new());
    let client = ApiClient::with_key_store(config(vec![server.endpoint()]), store.clone()).unwrap();
    let cancelled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&cancelled);
    client.on_auth_cancelled(move |dc| sink.lock().unwrap().push(dc));

    assert_eq!(client.call("echo:before").await, success("before"));
    assert_eq!(store.len(), 1);

    let outcome = client.call("revoke").await;
    assert!(matches!(outcome, Outcome::Error(RpcError::ServerError { code: 401, .. })));
    assert_eq!(*cancelled.lock().unwrap(), vec![DcId(1)]);
    assert!(!client.sessions().is_authenticated(DcId(1)));
    assert!(store.load_key(DcId(1)).unwrap().is_none());

    // The next call runs a fresh handshake
    assert_eq!(client.call("echo:after").await, success("after"));
    assert_eq!(server.handshakes(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_updates_arrive_in_order_before_reply() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![server.endpoint()])).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.on_update(move |dc, payload| sink.lock().unwrap().push((dc, payload)));

    assert_eq!(client.call("push:first").await, success("pushed"));
    assert_eq!(client.call("batch").await, success("batched"));
    assert_eq!(client.call("push:second").await, success("pushed"));

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (DcId(1), Bytes::from("first")),
            (DcId(1), Bytes::from("u1")),
            (DcId(1), Bytes::from("second")),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_server_salt_is_retried() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![server.endpoint()])).unwrap();

    assert_eq!(client.call("salt").await, success("salted"));
    let state = client.sessions().protocol_state(DcId(1)).unwrap();
    assert_eq!(state.server_salt, ROTATED_SALT);
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_call_survives_reconnection() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![server.endpoint()])).unwrap();

    assert_eq!(client.call("drop-once").await, success("survived"));
    let drops = server
        .requests()
        .iter()
        .filter(|r| r.as_ref() == b"drop-once")
        .count();
    assert_eq!(drops, 2);
    assert_eq!(server.handshakes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_key_invalidates_session() {
    let server = MockDc::start(DcId(1)).await;
    let client = ApiClient::new(config(vec![server.endpoint()])).unwrap();
    let invalidated = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&invalidated);
    client.on_updates_invalidated(move |dc| sink.lock().unwrap().push(dc));

    assert_eq!(
        client.call("garble").await,
        Outcome::Error(RpcError::Transport(TransportError::DecryptionFailed(DcId(1))))
    );
    assert_eq!(*invalidated.lock().unwrap(), vec![DcId(1)]);
    assert!(!client.sessions().is_authenticated(DcId(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stored_key_skips_handshake() {
    let server = MockDc::start(DcId(1)).await;
    let store = Arc::new(MemoryKeyStore::new());

    {
        let client = ApiClient::with_key_store(config(vec![server.endpoint()]), store.clone()).unwrap();
        assert_eq!(client.call("echo:one").await, success("one"));
    }
    assert_eq!(store.len(), 1);

    let client = ApiClient::with_key_store(config(vec![server.endpoint()]), store.clone()).unwrap();
    assert!(client.sessions().is_authenticated(DcId(1)));
    assert_eq!(client.call("echo:two").await, success("two"));
    assert_eq!(server.handshakes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_falls_back_when_primary_unreachable() {
    let dc2 = MockDc::start(DcId(2)).await;
    let client = ApiClient::new(config(vec![dead_endpoint(DcId(1)), dc2.endpoint()])).unwrap();
    assert_eq!(client.sessions().primary_dc(), DcId(1));

    client.authorize(DcId(2)).await.unwrap();
    assert_eq!(client.call("echo:fallback").await, success("fallback"));
    assert_eq!(dc2.requests(), vec![Bytes::from("echo:fallback")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_reachable_dc_fails_without_hanging() {
    let client = ApiClient::new(config(vec![dead_endpoint(DcId(1))])).unwrap();

    assert_eq!(
        client.call("echo:nowhere").await,
        Outcome::Error(RpcError::Transport(TransportError::NotAuthenticated(DcId(1))))
    );
}
