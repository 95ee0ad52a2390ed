//! Pending echo resolution for `echo-message`.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::event::{Event, ServerId};
use crate::irc::{Tags, irc_lower};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EchoKey {
    server: ServerId,
    target: String,
    text: String,
}

#[derive(Debug, Clone)]
struct PendingEcho {
    id: u64,
    target: String,
    text: String,
    created: Instant,
}

/// Strip formatting codes and surrounding whitespace so a server that
/// filters colours still matches.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x02' | '\x0f' | '\x11' | '\x16' | '\x1d' | '\x1e' | '\x1f' => {}
            '\x03' => {
                // \x03[fg[,bg]] with one or two digits each.
                for _ in 0..2 {
                    if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                        chars.next();
                    }
                }
                let mut look = chars.clone();
                if look.next() == Some(',') && look.peek().is_some_and(|c| c.is_ascii_digit()) {
                    chars.next();
                    for _ in 0..2 {
                        if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                            chars.next();
                        }
                    }
                }
            }
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

/// Sends waiting for their echo, FIFO per (server, target, text).
pub struct EchoTracker {
    pending: DashMap<EchoKey, VecDeque<PendingEcho>>,
    timeout: Duration,
}

impl EchoTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    fn key(server: &ServerId, target: &str, text: &str) -> EchoKey {
        EchoKey {
            server: server.clone(),
            target: irc_lower(target),
            text: normalize_text(text),
        }
    }

    pub fn record(&self, server: &ServerId, id: u64, target: &str, text: &str, now: Instant) {
        self.pending
            .entry(Self::key(server, target, text))
            .or_default()
            .push_back(PendingEcho {
                id,
                target: target.to_string(),
                text: text.to_string(),
                created: now,
            });
    }

    /// Consume the oldest pending send matching a self-authored message.
    pub fn resolve(&self, server: &ServerId, target: &str, text: &str, tags: &Tags) -> Option<Event> {
        let key = Self::key(server, target, text);
        let echo = {
            let mut queue = self.pending.get_mut(&key)?;
            queue.pop_front()?
        };
        self.pending.remove_if(&key, |_, q| q.is_empty());
        tracing::trace!(server = %server, id = echo.id, "Echo resolved");
        Some(Event::EchoResolved {
            pending_id: echo.id,
            target: echo.target,
            text: text.to_string(),
            tags: tags.clone(),
        })
    }

    /// Fail sends that were not echoed within the timeout.
    pub fn sweep(&self, now: Instant) -> Vec<(ServerId, Event)> {
        let mut failed = Vec::new();
        self.pending.retain(|key, queue| {
            while let Some(front) = queue.front() {
                if now.duration_since(front.created) < self.timeout {
                    break;
                }
                if let Some(echo) = queue.pop_front() {
                    failed.push((key.server.clone(), echo));
                }
            }
            !queue.is_empty()
        });
        failed.sort_by_key(|(_, e)| e.id);
        failed
            .into_iter()
            .map(|(server, echo)| (server, Self::failed(echo, "no echo within timeout")))
            .collect()
    }

    /// Fail every pending send of `server`.
    pub fn fail_server(&self, server: &ServerId) -> Vec<Event> {
        let mut failed = Vec::new();
        self.pending.retain(|key, queue| {
            if &key.server != server {
                return true;
            }
            failed.extend(queue.drain(..));
            false
        });
        failed.sort_by_key(|e| e.id);
        failed
            .into_iter()
            .map(|echo| Self::failed(echo, "disconnected before echo"))
            .collect()
    }

    fn failed(echo: PendingEcho, reason: &str) -> Event {
        Event::EchoFailed {
            pending_id: echo.id,
            target: echo.target,
            text: echo.text,
            reason: reason.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_exactly_once() {
        let t = EchoTracker::new(Duration::from_secs(30));
        let s = ServerId::from("net");
        let now = Instant::now();
        t.record(&s, 7, "#chan", "hello", now);

        let ev = t.resolve(&s, "#Chan", "hello", &Tags::new()).unwrap();
        assert!(matches!(ev, Event::EchoResolved { pending_id: 7, .. }));
        assert!(t.resolve(&s, "#chan", "hello", &Tags::new()).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn duplicates_resolve_in_send_order() {
        let t = EchoTracker::new(Duration::from_secs(30));
        let s = ServerId::from("net");
        let now = Instant::now();
        t.record(&s, 1, "#c", "hi", now);
        t.record(&s, 2, "#c", "hi", now);
        assert!(matches!(t.resolve(&s, "#c", "hi", &Tags::new()), Some(Event::EchoResolved { pending_id: 1, .. })));
        assert!(matches!(t.resolve(&s, "#c", "hi", &Tags::new()), Some(Event::EchoResolved { pending_id: 2, .. })));
    }

    #[test]
    fn formatting_is_ignored_when_matching() {
        let t = EchoTracker::new(Duration::from_secs(30));
        let s = ServerId::from("net");
        t.record(&s, 1, "#c", "\x02bold\x02 \x0304,12red\x03 ", Instant::now());
        assert!(t.resolve(&s, "#c", "bold red", &Tags::new()).is_some());
        assert_eq!(normalize_text("\x0312blue"), "blue");
    }

    #[test]
    fn sweep_fails_old_sends() {
        let t = EchoTracker::new(Duration::from_secs(30));
        let s = ServerId::from("net");
        let t0 = Instant::now();
        t.record(&s, 1, "#c", "a", t0);
        t.record(&s, 2, "#c", "b", t0 + Duration::from_secs(20));
        let failed = t.sweep(t0 + Duration::from_secs(30));
        assert_eq!(failed.len(), 1);
        assert!(matches!(&failed[0].1, Event::EchoFailed { pending_id: 1, .. }));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn disconnect_fails_only_that_server() {
        let t = EchoTracker::new(Duration::from_secs(30));
        let now = Instant::now();
        t.record(&ServerId::from("a"), 1, "#c", "x", now);
        t.record(&ServerId::from("b"), 2, "#c", "x", now);
        let failed = t.fail_server(&ServerId::from("a"));
        assert_eq!(failed.len(), 1);
        assert!(matches!(&failed[0], Event::EchoFailed { reason, .. } if reason == "disconnected before echo"));
        assert_eq!(t.len(), 1);
    }
}
