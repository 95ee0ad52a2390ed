//! Connection supervisor behaviour against an in-memory fake server.
//!
//! These run on a paused clock: tokio advances time whenever every task is
//! idle, so liveness and backoff timers fire without real waiting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{collect_until, drain_events, harness, harness_with_store, server_config, wait_for};
use halyard_sdk::config::SaslConfig;
use halyard_sdk::sasl::SaslMechanism;
use halyard_sdk::sts::MemoryStsStore;
use halyard_sdk::{ConnectionState, Event};

#[tokio::test(start_paused = true)]
async fn ping_timeout_yields_one_disconnect_then_reconnects() {
    let mut h = harness(server_config("tester"), |_| {});
    let mut events = h.engine.events();

    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.register("tester", "").await;
    wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered").await;
    assert_eq!(h.engine.current_nick(&h.id).as_deref(), Some("tester"));

    // The server goes silent.
    let seen = collect_until(&mut events, |e| matches!(e, Event::Reconnecting { .. }), "reconnecting").await;
    let disconnects: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            Event::Disconnected { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(disconnects.len(), 1, "events: {seen:?}");
    assert_eq!(disconnects[0], "ping timeout");
    assert!(matches!(seen.last(), Some(Event::Reconnecting { attempt: 1, .. })));

    // A keepalive went out before the timeout.
    let sent = server.drain().await;
    assert!(sent.iter().any(|l| l == "PING :keepalive"), "{sent:?}");

    // The reconnect opens a fresh session with no second Disconnected.
    let mut second = h.accept().await;
    let seen = collect_until(&mut events, |e| matches!(e, Event::Connected { .. }), "connected again").await;
    assert!(!seen.iter().any(|e| matches!(e, Event::Disconnected { .. })), "{seen:?}");
    second.register("tester", "").await;
    wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered again").await;

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_never_reconnects() {
    let mut h = harness(server_config("tester"), |_| {});
    let mut events = h.engine.events();

    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.register("tester", "").await;
    wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered").await;

    h.engine.disconnect(&h.id, Some("see you")).await.unwrap();
    assert_eq!(server.expect("QUIT").await, "QUIT :see you");
    drop(server);

    let ev = wait_for(&mut events, |e| matches!(e, Event::Disconnected { .. }), "disconnected").await;
    assert!(matches!(ev, Event::Disconnected { ref reason } if reason == "see you"));

    tokio::time::sleep(Duration::from_secs(600)).await;
    let later = drain_events(&mut events);
    assert!(
        !later.iter().any(|e| matches!(e, Event::Reconnecting { .. } | Event::Connecting { .. })),
        "{later:?}"
    );
    assert!(h.accepted.try_recv().is_err());
    assert_eq!(h.engine.state(&h.id), Some(ConnectionState::Disconnected));
    assert_eq!(h.engine.current_nick(&h.id), None);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn goodbye_is_bounded_when_server_never_closes() {
    let mut h = harness(server_config("tester"), |_| {});
    let mut events = h.engine.events();

    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.register("tester", "").await;
    wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered").await;

    h.engine.disconnect(&h.id, None).await.unwrap();
    server.expect("QUIT").await;
    // Keep the server end open: the goodbye timeout must still finish it.
    let ev = wait_for(&mut events, |e| matches!(e, Event::Disconnected { .. }), "disconnected").await;
    assert!(matches!(ev, Event::Disconnected { .. }));
    assert_eq!(h.engine.state(&h.id), Some(ConnectionState::Disconnected));

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connect_during_disconnect_is_queued() {
    let mut h = harness(server_config("tester"), |_| {});
    let mut events = h.engine.events();

    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.register("tester", "").await;
    wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered").await;

    h.engine.disconnect(&h.id, Some("cycle")).await.unwrap();
    h.engine.connect(&h.id).await.unwrap();
    server.expect("QUIT").await;
    drop(server);

    let seen = collect_until(&mut events, |e| matches!(e, Event::Connecting { .. }), "connecting").await;
    assert!(seen.iter().any(|e| matches!(e, Event::Disconnected { reason } if reason == "cycle")));
    let _second = h.accept().await;

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_connect_opens_one_session() {
    let mut h = harness(server_config("tester"), |_| {});
    h.engine.connect(&h.id).await.unwrap();
    h.engine.connect(&h.id).await.unwrap();
    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.register("tester", "").await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.accepted.try_recv().is_err());
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_are_fatal() {
    let mut h = harness_with_store(
        server_config("tester"),
        |c| c.reconnect.max_attempts = Some(2),
        Arc::new(MemoryStsStore::default()),
        true,
    );
    let mut events = h.engine.events();
    h.engine.connect(&h.id).await.unwrap();

    let seen = collect_until(&mut events, |e| matches!(e, Event::Fatal { .. }), "fatal").await;
    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            Event::Reconnecting { attempt, delay, .. } => {
                assert!(*delay <= Duration::from_millis(30_000));
                Some(*attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    let disconnects = seen.iter().filter(|e| matches!(e, Event::Disconnected { .. })).count();
    assert_eq!(disconnects, 3);
    assert_eq!(h.engine.state(&h.id), Some(ConnectionState::Disconnected));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(drain_events(&mut events).is_empty());
    assert!(h.accepted.try_recv().is_err());
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fatal_auth_failure_suppresses_reconnect() {
    let mut config = server_config("tester");
    config.sasl = Some(SaslConfig {
        mechanism: SaslMechanism::Plain,
        account: "tester".into(),
        password: Some("wrong".into()),
        key: None,
        fatal_on_failure: true,
    });
    let mut h = harness(config, |_| {});
    let mut events = h.engine.events();

    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.expect("CAP LS").await;
    server.send(":srv CAP * LS :sasl=PLAIN").await;
    assert_eq!(server.expect("CAP REQ").await, "CAP REQ :sasl");
    server.send(":srv CAP * ACK :sasl").await;
    assert_eq!(server.expect("AUTHENTICATE").await, "AUTHENTICATE PLAIN");
    server.send("AUTHENTICATE +").await;
    server.expect("AUTHENTICATE").await;
    server.send(":srv 904 tester :SASL authentication failed").await;

    let seen = collect_until(&mut events, |e| matches!(e, Event::Disconnected { .. }), "disconnected").await;
    assert!(seen.iter().any(|e| matches!(e, Event::AuthFailed { fatal: true, .. })), "{seen:?}");

    tokio::time::sleep(Duration::from_secs(600)).await;
    let later = drain_events(&mut events);
    assert!(!later.iter().any(|e| matches!(e, Event::Reconnecting { .. })), "{later:?}");
    assert_eq!(h.engine.state(&h.id), Some(ConnectionState::Disconnected));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn nick_collision_retries_with_suffix() {
    let mut h = harness(server_config("tester"), |_| {});
    let mut events = h.engine.events();
    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.expect("CAP LS").await;
    server.send(":srv CAP * LS :").await;
    server.expect("CAP END").await;
    server.send(":srv 433 * tester :Nickname is already in use").await;
    assert_eq!(server.expect("NICK").await, "NICK tester1");
    server.send(":srv 001 tester1 :Welcome").await;

    let ev = wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered").await;
    assert!(matches!(ev, Event::Registered { ref nick } if nick == "tester1"));
    assert_eq!(h.engine.current_nick(&h.id).as_deref(), Some("tester1"));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_reconnecting_cancels_the_timer() {
    let mut h = harness(server_config("tester"), |_| {});
    let mut events = h.engine.events();

    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.register("tester", "").await;
    wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered").await;

    drop(server);
    wait_for(&mut events, |e| matches!(e, Event::Reconnecting { attempt: 1, .. }), "reconnecting").await;
    assert_eq!(h.engine.state(&h.id), Some(ConnectionState::Reconnecting));

    h.engine.disconnect(&h.id, Some("stop")).await.unwrap();
    let ev = wait_for(&mut events, |e| matches!(e, Event::Disconnected { .. }), "disconnected").await;
    assert!(matches!(ev, Event::Disconnected { ref reason } if reason == "stop"));

    tokio::time::sleep(Duration::from_secs(600)).await;
    let later = drain_events(&mut events);
    assert!(
        !later.iter().any(|e| matches!(e, Event::Connecting { .. } | Event::Reconnecting { .. })),
        "{later:?}"
    );
    assert!(h.accepted.try_recv().is_err());
    assert_eq!(h.engine.state(&h.id), Some(ConnectionState::Disconnected));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn oversized_line_is_dropped_and_session_continues() {
    let mut h = harness(server_config("tester"), |_| {});
    let mut events = h.engine.events();

    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.register("tester", "").await;
    wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered").await;

    let flood = "x".repeat(20_000);
    server.send(&format!(":srv NOTICE tester :{flood}")).await;
    server.send(":alice!a@h PRIVMSG tester :after").await;

    let seen = collect_until(&mut events, |e| matches!(e, Event::Message { .. }), "message").await;
    assert!(matches!(seen.last(), Some(Event::Message { text, .. }) if text == "after"), "{seen:?}");
    assert!(
        !seen.iter().any(|e| matches!(e, Event::ServerNotice { .. } | Event::RawLine(_) | Event::Disconnected { .. })),
        "{seen:?}"
    );
    assert_eq!(h.engine.state(&h.id), Some(ConnectionState::Connected));
    h.engine.shutdown().await;
}
