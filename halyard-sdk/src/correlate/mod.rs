//! Inbound correlation and dedup.
//!
//! The correlator consumes the raw bus and republishes a refined stream:
//! multiline chains folded, replayed history deduplicated, own messages
//! resolved against pending echoes, labeled replies attached to their
//! requests, and netsplits inferred from quit cascades. All state is keyed
//! by server and dropped or failed when that server disconnects.

pub mod debounce;
pub mod echo;
pub mod history;
pub mod labels;
pub mod multiline;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bus::{EventBus, EventStream};
use crate::config::CorrelationConfig;
use crate::event::{Event, ServerId};

use debounce::{NetsplitDebounce, parse_netsplit_reason};
use echo::EchoTracker;
use history::HistoryDedup;
use labels::LabelTracker;
use multiline::MultilineFolder;

pub struct Correlator {
    multiline: MultilineFolder,
    labels: LabelTracker,
    echoes: EchoTracker,
    netsplits: NetsplitDebounce,
    history: HistoryDedup,
}

impl Correlator {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self {
            multiline: MultilineFolder::new(config.multiline_ttl()),
            labels: LabelTracker::new(config.label_window(), config.label_timeout()),
            echoes: EchoTracker::new(config.echo_timeout()),
            netsplits: NetsplitDebounce::new(config.netsplit_window(), config.netsplit_cap),
            history: HistoryDedup::new(config.history_capacity, config.history_max_age()),
        }
    }

    /// Refine one raw event into zero or more output events.
    pub fn process(&self, server: &ServerId, event: Event, now: Instant) -> Vec<Event> {
        let mut out = Vec::new();
        match event {
            Event::OutboundMessage {
                pending_id,
                ref target,
                ref text,
                ..
            } => {
                self.echoes.record(server, pending_id, target, text, now);
                out.push(event);
            }
            Event::LabeledRequestSent {
                ref label,
                ref context,
                ref preview,
            } => {
                self.labels.register(server, label, context, preview, now);
                out.push(event);
            }
            Event::Disconnected { .. } => {
                out.push(event);
                out.extend(self.echoes.fail_server(server));
                out.extend(self.labels.clear_server(server).into_iter().map(|(_, ev)| ev));
                self.multiline.clear_server(server);
                self.netsplits.clear_server(server);
                self.history.clear_server(server);
            }
            Event::BatchStart {
                ref id,
                ref batch_type,
                ..
            } => {
                self.history.batch_started(server, id, batch_type);
                out.push(self.labels.correlate(server, event, now));
            }
            Event::BatchEnd { ref id, .. } => {
                let id = id.clone();
                for folded in self.multiline.flush_batch(server, &id) {
                    out.extend(self.refine_message(server, folded, now));
                }
                self.history.batch_ended(server, &id);
                out.push(self.labels.correlate(server, event, now));
            }
            Event::Message { .. } => {
                if let Some(folded) = self.multiline.fold(server, event, now) {
                    out.extend(self.refine_message(server, folded, now));
                }
            }
            Event::UserQuit { ref reason, .. } => {
                let split = parse_netsplit_reason(reason);
                out.push(event);
                if let Some((server1, server2)) = split
                    && self.netsplits.should_notify(server, &server1, &server2, now)
                {
                    tracing::info!(server = %server, %server1, %server2, "Netsplit detected");
                    out.push(Event::NetsplitDetected { server1, server2 });
                }
            }
            other => out.push(self.labels.correlate(server, other, now)),
        }
        out
    }

    fn refine_message(&self, server: &ServerId, event: Event, now: Instant) -> Option<Event> {
        if self.history.is_duplicate(server, &event, now) {
            return None;
        }
        let event = match event {
            Event::Message {
                self_authored: true,
                ref target,
                ref text,
                ref tags,
                ..
            } => self
                .echoes
                .resolve(server, target, text, tags)
                .unwrap_or(event),
            other => other,
        };
        Some(self.labels.correlate(server, event, now))
    }

    /// Expire labels, echoes and multiline buffers.
    pub fn sweep(&self, now: Instant) -> Vec<(ServerId, Event)> {
        let mut out = self.labels.sweep(now);
        out.extend(self.echoes.sweep(now));
        self.multiline.sweep(now);
        self.history.sweep(now);
        out
    }
}

/// Run `correlator` between the raw and refined buses until the raw bus
/// closes. The refined bus is closed on exit.
pub fn spawn(
    correlator: Arc<Correlator>,
    mut raw: EventStream,
    refined: EventBus,
    config: &CorrelationConfig,
) -> JoinHandle<()> {
    let period = config.sweep_interval();
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                ev = raw.recv() => {
                    let Some(ev) = ev else { break };
                    for out in correlator.process(&ev.server, ev.event, Instant::now()) {
                        refined.publish(&ev.server, out);
                    }
                }
                _ = sweep.tick() => {
                    for (server, out) in correlator.sweep(Instant::now()) {
                        refined.publish(&server, out);
                    }
                }
            }
        }
        tracing::debug!("Correlator stopped");
        refined.close();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageKind;
    use crate::irc::Tags;

    fn correlator() -> Correlator {
        Correlator::new(&CorrelationConfig::default())
    }

    fn own(text: &str) -> Event {
        Event::Message {
            from: "me".into(),
            target: "#chan".into(),
            text: text.into(),
            tags: Tags::new(),
            kind: MessageKind::Privmsg,
            self_authored: true,
        }
    }

    #[test]
    fn echo_resolves_once_then_passes_through() {
        let c = correlator();
        let s = ServerId::from("net");
        let now = Instant::now();
        c.process(
            &s,
            Event::OutboundMessage {
                pending_id: 1,
                target: "#chan".into(),
                text: "hello".into(),
                kind: MessageKind::Privmsg,
            },
            now,
        );
        let first = c.process(&s, own("hello"), now);
        assert!(matches!(first.as_slice(), [Event::EchoResolved { pending_id: 1, .. }]));
        let second = c.process(&s, own("hello"), now);
        assert!(matches!(second.as_slice(), [Event::Message { .. }]));
    }

    #[test]
    fn disconnect_fails_pending_state() {
        let c = correlator();
        let s = ServerId::from("net");
        let now = Instant::now();
        c.process(
            &s,
            Event::OutboundMessage {
                pending_id: 4,
                target: "#chan".into(),
                text: "hi".into(),
                kind: MessageKind::Privmsg,
            },
            now,
        );
        c.process(
            &s,
            Event::LabeledRequestSent {
                label: "hl1".into(),
                context: "#chan".into(),
                preview: "WHO #chan".into(),
            },
            now,
        );
        let out = c.process(&s, Event::Disconnected { reason: "gone".into() }, now);
        assert!(matches!(out[0], Event::Disconnected { .. }));
        assert!(out.iter().any(|e| matches!(e, Event::EchoFailed { pending_id: 4, .. })));
        assert!(out.iter().any(|e| matches!(e, Event::LabeledTimeout { .. })));
        assert!(c.sweep(now + std::time::Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn quit_cascade_yields_one_netsplit() {
        let c = correlator();
        let s = ServerId::from("net");
        let now = Instant::now();
        let mut notices = 0;
        for i in 0..20 {
            let out = c.process(
                &s,
                Event::UserQuit {
                    nick: format!("user{i}"),
                    reason: "hub.example.net leaf.example.net".into(),
                },
                now,
            );
            notices += out
                .iter()
                .filter(|e| matches!(e, Event::NetsplitDetected { .. }))
                .count();
        }
        assert_eq!(notices, 1);
    }

    #[test]
    fn labeled_ack_is_wrapped() {
        let c = correlator();
        let s = ServerId::from("net");
        let now = Instant::now();
        c.process(
            &s,
            Event::LabeledRequestSent {
                label: "hl9".into(),
                context: "status".into(),
                preview: "MODE #c".into(),
            },
            now,
        );
        let mut tags = Tags::new();
        tags.insert("label", "hl9");
        let out = c.process(&s, Event::Ack { tags }, now);
        assert!(matches!(out.as_slice(), [Event::LabeledReply { .. }]));
    }
}
