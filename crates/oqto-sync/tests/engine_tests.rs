//! Engine integration tests over a scripted transport.
//!
//! Streams must be queued with `accept` before the first await after
//! `test_engine`, since connections open as soon as the runtime polls them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use oqto_sync::protocol::{RunState, Session, SyncEvent};
use oqto_sync::{ConnectionStatus, Dispatch, DirectoryStore, Hydration, ServerEndpoint, Visibility};

mod common;
use common::{DIR_A, DIR_B, SERVER_A, SERVER_B, bare_frame, frame, session, test_engine};

async fn wait_store<F>(rx: &mut tokio::sync::watch::Receiver<DirectoryStore>, mut pred: F) -> DirectoryStore
where
    F: FnMut(&DirectoryStore) -> bool,
{
    rx.wait_for(|store| pred(store)).await.unwrap().clone()
}

#[tokio::test(start_paused = true)]
async fn test_events_from_all_servers_reach_the_store() {
    let t = test_engine(&[(SERVER_A, DIR_A), (SERVER_B, DIR_B)]);
    let a = t.transport.accept(SERVER_A);
    let b = t.transport.accept(SERVER_B);
    let mut status = t.engine.status();
    let mut store = t.engine.store();

    status
        .wait_for(|s| s.server_count == 2 && s.servers.iter().all(|e| e.status == ConnectionStatus::Connected))
        .await
        .unwrap();

    a.event(DIR_A, "session.created", session("ses_1", "alpha"));
    b.event(DIR_B, "session.created", session("ses_2", "beta"));
    b.event(
        DIR_B,
        "session.status",
        json!({ "sessionID": "ses_2", "status": { "type": "busy" } }),
    );

    let snapshot = wait_store(&mut store, |s| {
        s.get_sessions(DIR_A).len() == 1 && s.get_session_status(DIR_B, "ses_2").is_some()
    })
    .await;
    assert_eq!(snapshot.get_session(DIR_A, "ses_1").unwrap().title, "alpha");
    assert_eq!(snapshot.get_session(DIR_B, "ses_2").unwrap().title, "beta");
    assert_eq!(snapshot.get_session_status(DIR_B, "ses_2"), Some(RunState::Running));
    assert!(snapshot.get_session(DIR_A, "ses_2").is_none());

    t.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bare_payload_uses_endpoint_directory() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let a = t.transport.accept(SERVER_A);
    let mut store = t.engine.store();

    a.raw(bare_frame("session.created", session("ses_1", "bare")));
    let snapshot = wait_store(&mut store, |s| !s.get_sessions(DIR_A).is_empty()).await;
    assert_eq!(snapshot.get_session(DIR_A, "ses_1").unwrap().title, "bare");

    t.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_keeps_snapshot_identity() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let a = t.transport.accept(SERVER_A);
    let mut store = t.engine.store();

    a.event(DIR_A, "session.updated", session("ses_1", "once"));
    let first = wait_store(&mut store, |s| !s.get_sessions(DIR_A).is_empty()).await;
    let before = Arc::clone(first.directory(DIR_A).unwrap());

    // Redeliver, then touch another directory so a snapshot is published.
    a.event(DIR_A, "session.updated", session("ses_1", "once"));
    a.event(DIR_B, "session.created", session("ses_9", "other"));
    let second = wait_store(&mut store, |s| !s.get_sessions(DIR_B).is_empty()).await;

    assert!(Arc::ptr_eq(&before, second.directory(DIR_A).unwrap()));
    assert_eq!(second.get_sessions(DIR_A), first.get_sessions(DIR_A));

    t.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_raw_subscribers_see_tagged_events() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let a = t.transport.accept(SERVER_A);
    let mut raw = t.engine.subscribe_raw();

    a.heartbeat();
    a.event(DIR_A, "lsp.updated", json!({}));

    let heartbeat = raw.recv().await.unwrap();
    assert_eq!(heartbeat.server, SERVER_A);
    assert_eq!(heartbeat.directory(), DIR_A);
    assert_eq!(heartbeat.event, SyncEvent::ServerHeartbeat);

    let unknown = raw.recv().await.unwrap();
    assert_eq!(
        unknown.event,
        SyncEvent::Unknown {
            kind: "lsp.updated".to_string()
        }
    );
    assert_eq!(unknown.raw.payload.kind, "lsp.updated");

    t.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_batched_subscriber_gets_heartbeat_first() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let a = t.transport.accept(SERVER_A);
    let (tx, mut dispatches) = mpsc::unbounded_channel();
    let subscription = t.engine.subscribe_batched(move |dispatch| {
        let _ = tx.send(dispatch);
    });

    // One chunk carrying five events and a trailing heartbeat.
    let mut chunk = String::new();
    for i in 0..5 {
        chunk.push_str(&frame(DIR_A, "session.created", session(&format!("ses_{i}"), "burst")));
    }
    chunk.push_str(&bare_frame("server.heartbeat", json!({})));
    a.raw(chunk);

    match dispatches.recv().await {
        Some(Dispatch::Immediate(event)) => assert_eq!(event.event, SyncEvent::ServerHeartbeat),
        other => panic!("Expected immediate heartbeat, got {:?}", other),
    }
    match dispatches.recv().await {
        Some(Dispatch::Batch(events)) => {
            let ids: Vec<String> = events
                .iter()
                .map(|e| match &e.event {
                    SyncEvent::SessionCreated(session) => session.id.clone(),
                    other => panic!("Expected session.created, got {:?}", other),
                })
                .collect();
            assert_eq!(ids, vec!["ses_0", "ses_1", "ses_2", "ses_3", "ses_4"]);
        }
        other => panic!("Expected batch, got {:?}", other),
    }

    subscription.unsubscribe().await;
    t.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hydration_goes_through_the_writer() {
    let t = test_engine(&[]);
    let mut store = t.engine.store();

    let sessions: Vec<Session> =
        serde_json::from_value(json!([{ "id": "ses_b" }, { "id": "ses_a" }])).unwrap();
    t.engine
        .hydrate(Hydration::Sessions {
            directory: DIR_A.to_string(),
            sessions,
        })
        .unwrap();

    let snapshot = wait_store(&mut store, |s| s.is_ready(DIR_A)).await;
    let ids: Vec<&str> = snapshot
        .get_sessions(DIR_A)
        .iter()
        .map(|s| s.id.as_str())
        .collect();
    assert_eq!(ids, vec!["ses_a", "ses_b"]);

    t.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hydration_lands_after_queued_events() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let a = t.transport.accept(SERVER_A);
    let store = t.engine.store();
    let mut raw = t.engine.subscribe_raw();

    a.event(DIR_A, "session.updated", session("ses_1", "old title"));
    raw.recv().await.unwrap();

    // The streamed upsert is still inside the batch window here.
    let sessions: Vec<Session> =
        serde_json::from_value(json!([{ "id": "ses_1", "title": "new title" }])).unwrap();
    t.engine
        .hydrate(Hydration::Sessions {
            directory: DIR_A.to_string(),
            sessions,
        })
        .unwrap();
    t.engine.shutdown().await;

    let snapshot = store.borrow().clone();
    assert!(snapshot.is_ready(DIR_A));
    assert_eq!(snapshot.get_session(DIR_A, "ses_1").unwrap().title, "new title");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_queued_events() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let a = t.transport.accept(SERVER_A);
    let store = t.engine.store();
    let mut raw = t.engine.subscribe_raw();

    a.event(DIR_A, "session.created", session("ses_1", "late"));
    raw.recv().await.unwrap();
    // Still inside the batch window.
    t.engine.shutdown().await;

    assert_eq!(store.borrow().get_sessions(DIR_A).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_failure_reconnects_after_backoff() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let first = t.transport.accept(SERVER_A);
    let second = t.transport.accept(SERVER_A);
    let mut status = t.engine.status();
    let mut store = t.engine.store();
    let endpoint = ServerEndpoint::new(SERVER_A, DIR_A);

    status.wait_for(|s| s.connected).await.unwrap();
    let start = tokio::time::Instant::now();
    first.fail("connection reset");

    let errored = status
        .wait_for(|s| s.server(&endpoint).is_some_and(|e| e.status == ConnectionStatus::Error))
        .await
        .unwrap()
        .server(&endpoint)
        .cloned()
        .unwrap();
    assert_eq!(errored.retry_count, 1);

    status.wait_for(|s| s.connected).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(3_000));
    assert_eq!(t.transport.opens(), 2);

    // Events resume on the new stream.
    second.event(DIR_A, "session.created", session("ses_1", "after"));
    wait_store(&mut store, |s| !s.get_sessions(DIR_A).is_empty()).await;

    t.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_visibility_round_trip() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let _first = t.transport.accept(SERVER_A);
    let second = t.transport.accept(SERVER_A);
    let mut status = t.engine.status();
    let mut store = t.engine.store();

    status.wait_for(|s| s.connected).await.unwrap();
    t.engine.set_visibility(Visibility::Hidden);
    status
        .wait_for(|s| s.servers.iter().all(|e| e.status == ConnectionStatus::Paused))
        .await
        .unwrap();

    // Longer than the heartbeat timeout: nothing reconnects while hidden.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(t.transport.opens(), 1);

    t.engine.set_visibility(Visibility::Visible);
    status.wait_for(|s| s.connected).await.unwrap();
    assert_eq!(t.transport.opens(), 2);

    second.event(DIR_A, "session.created", session("ses_1", "visible"));
    wait_store(&mut store, |s| !s.get_sessions(DIR_A).is_empty()).await;

    t.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_adds_servers() {
    let t = test_engine(&[(SERVER_A, DIR_A)]);
    let _a = t.transport.accept(SERVER_A);
    let b = t.transport.accept(SERVER_B);
    let mut status = t.engine.status();
    let mut store = t.engine.store();

    status.wait_for(|s| s.connected && s.server_count == 1).await.unwrap();

    t.discovery
        .replace(vec![
            ServerEndpoint::new(SERVER_A, DIR_A),
            ServerEndpoint::new(SERVER_B, DIR_B),
        ])
        .await;
    t.engine.rediscover();
    status
        .wait_for(|s| s.server_count == 2 && s.servers.iter().all(|e| e.status == ConnectionStatus::Connected))
        .await
        .unwrap();

    b.event(DIR_B, "session.created", session("ses_b", "new server"));
    wait_store(&mut store, |s| !s.get_sessions(DIR_B).is_empty()).await;

    t.engine.shutdown().await;
}
