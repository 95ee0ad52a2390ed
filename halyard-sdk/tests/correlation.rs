//! Refined stream behaviour: echoes, labels, multiline folding and
//! netsplit inference, driven through the whole engine.

mod common;

use common::{FakeServer, Harness, collect_until, harness, server_config, wait_for};
use halyard_sdk::bus::EventStream;
use halyard_sdk::Event;
use halyard_sdk::event::LabelOutcome;

const CAPS: &str = "echo-message labeled-response batch draft/multiline message-tags server-time";

async fn registered() -> (Harness, FakeServer, EventStream) {
    let mut h = harness(server_config("tester"), |_| {});
    let mut events = h.engine.events();
    h.engine.connect(&h.id).await.unwrap();
    let mut server = h.accept().await;
    server.register("tester", CAPS).await;
    wait_for(&mut events, |e| matches!(e, Event::Registered { .. }), "registered").await;
    (h, server, events)
}

#[tokio::test]
async fn echoed_message_resolves_pending_send() {
    let (h, mut server, mut events) = registered().await;

    let id = h.engine.send_message(&h.id, "#chan", "hello there").await.unwrap();
    assert_eq!(server.expect("PRIVMSG").await, "PRIVMSG #chan :hello there");
    let ev = wait_for(&mut events, |e| matches!(e, Event::OutboundMessage { .. }), "outbound").await;
    assert!(matches!(ev, Event::OutboundMessage { pending_id, .. } if pending_id == id));

    server
        .send("@msgid=abc :tester!u@h PRIVMSG #chan :hello there")
        .await;
    let ev = wait_for(&mut events, |e| matches!(e, Event::EchoResolved { .. }), "echo").await;
    match ev {
        Event::EchoResolved { pending_id, target, tags, .. } => {
            assert_eq!(pending_id, id);
            assert_eq!(target, "#chan");
            assert_eq!(tags.get("msgid"), Some("abc"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // Nothing pending any more: a repeat is a plain message.
    server.send(":tester!u@h PRIVMSG #chan :hello there").await;
    let ev = wait_for(&mut events, |e| matches!(e, Event::Message { .. } | Event::EchoResolved { .. }), "message").await;
    assert!(matches!(ev, Event::Message { self_authored: true, .. }), "{ev:?}");

    h.engine.shutdown().await;
}

#[tokio::test]
async fn labeled_ack_is_attached_to_its_request() {
    let (h, mut server, mut events) = registered().await;

    h.engine.send_labeled(&h.id, "WHO #chan", "#chan").await.unwrap();
    let line = server.expect("@label=").await;
    let (tag, rest) = line.split_once(' ').unwrap();
    assert_eq!(rest, "WHO #chan");
    let label = tag.strip_prefix("@label=").unwrap().to_string();
    assert!(label.starts_with("hl"));

    server.send(&format!("@label={label} :srv ACK")).await;
    let ev = wait_for(&mut events, |e| matches!(e, Event::LabeledReply { .. }), "labeled reply").await;
    match ev {
        Event::LabeledReply { label: got, context, preview, outcome, .. } => {
            assert_eq!(got, label);
            assert_eq!(context, "#chan");
            assert_eq!(preview, "WHO #chan");
            assert_eq!(outcome, LabelOutcome::Success);
        }
        other => panic!("unexpected {other:?}"),
    }
    h.engine.shutdown().await;
}

#[tokio::test]
async fn multiline_batch_is_delivered_as_one_message() {
    let (h, mut server, mut events) = registered().await;

    server.send(":srv BATCH +ml1 draft/multiline #chan").await;
    server
        .send("@batch=ml1;draft/multiline-concat :alice!a@h PRIVMSG #chan :a")
        .await;
    server
        .send("@batch=ml1;draft/multiline-concat :alice!a@h PRIVMSG #chan :b")
        .await;
    server.send("@batch=ml1 :alice!a@h PRIVMSG #chan :c").await;
    server.send(":srv BATCH -ml1").await;
    server.send(":alice!a@h PRIVMSG #chan :after").await;

    let mut texts = Vec::new();
    while texts.last().map(String::as_str) != Some("after") {
        let ev = wait_for(&mut events, |e| matches!(e, Event::Message { .. }), "message").await;
        if let Event::Message { text, .. } = ev {
            texts.push(text);
        }
    }
    assert_eq!(texts, vec!["a\nb\nc".to_string(), "after".to_string()]);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn quit_cascade_reports_one_netsplit() {
    let (h, mut server, mut events) = registered().await;

    for i in 0..10 {
        server
            .send(&format!(":user{i}!u@h QUIT :hub.example.net leaf.example.net"))
            .await;
    }
    server.send(":alice!a@h PRIVMSG #chan :done").await;

    let mut splits = 0;
    let mut quits = 0;
    loop {
        let ev = wait_for(&mut events, |_| true, "events").await;
        match ev {
            Event::UserQuit { .. } => quits += 1,
            Event::NetsplitDetected { server1, server2 } => {
                assert_eq!(server1, "hub.example.net");
                assert_eq!(server2, "leaf.example.net");
                splits += 1;
            }
            Event::Message { .. } => break,
            _ => {}
        }
    }
    assert_eq!(quits, 10);
    assert_eq!(splits, 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn disconnect_fails_outstanding_echoes() {
    let (h, mut server, mut events) = registered().await;

    let id = h.engine.send_message(&h.id, "#chan", "lost").await.unwrap();
    server.expect("PRIVMSG").await;
    drop(server);

    let ev = wait_for(&mut events, |e| matches!(e, Event::EchoFailed { .. }), "echo failed").await;
    match ev {
        Event::EchoFailed { pending_id, reason, .. } => {
            assert_eq!(pending_id, id);
            assert_eq!(reason, "disconnected before echo");
        }
        other => panic!("unexpected {other:?}"),
    }
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_labeled_request_times_out() {
    let (h, mut server, mut events) = registered().await;

    h.engine.send_labeled(&h.id, "MODE #chan", "#chan").await.unwrap();
    let line = server.expect("@label=").await;
    let label = line
        .split_once(' ')
        .and_then(|(tag, _)| tag.strip_prefix("@label="))
        .unwrap()
        .to_string();

    let started = tokio::time::Instant::now();
    let seen = collect_until(&mut events, |e| matches!(e, Event::LabeledTimeout { .. }), "label timeout").await;
    assert!(started.elapsed() >= std::time::Duration::from_secs(30));
    assert!(!seen.iter().any(|e| matches!(e, Event::Disconnected { .. })), "{seen:?}");
    match seen.last() {
        Some(Event::LabeledTimeout { label: got, context, preview }) => {
            assert_eq!(got, &label);
            assert_eq!(context, "#chan");
            assert_eq!(preview, "MODE #chan");
        }
        other => panic!("unexpected {other:?}"),
    }

    // A reply after the timeout is ordinary traffic.
    server.send(&format!("@label={label} :srv ACK")).await;
    let ev = wait_for(&mut events, |e| matches!(e, Event::Ack { .. } | Event::LabeledReply { .. }), "late ack").await;
    assert!(matches!(ev, Event::Ack { .. }), "{ev:?}");
    h.engine.shutdown().await;
}
