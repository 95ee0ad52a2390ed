//! Multiline fold.
//!
//! Chunks of one logical message arrive as separate PRIVMSG/NOTICE lines
//! sharing a `batch` tag. A chunk carrying the concat marker is buffered;
//! the next chunk for the same key without the marker flushes the buffer
//! as one message with the chunk texts joined by `\n`.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::event::{Event, MessageKind, ServerId};
use crate::irc::{Tags, irc_lower};

/// Tag marking a chunk that continues into the next one.
pub const CONCAT_TAG: &str = "draft/multiline-concat";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FoldKey {
    server: ServerId,
    batch: String,
    kind: MessageKind,
    sender: String,
    target: String,
}

#[derive(Debug)]
struct Buffer {
    from: String,
    target: String,
    kind: MessageKind,
    self_authored: bool,
    parts: Vec<String>,
    tags: Tags,
    first_seen: Instant,
}

impl Buffer {
    fn into_event(mut self, last: Option<(String, &Tags)>) -> Event {
        if let Some((text, tags)) = last {
            self.parts.push(text);
            let earliest_time = self.tags.get("time").map(String::from);
            self.tags.merge_from(tags);
            if let Some(time) = earliest_time {
                self.tags.insert("time", time);
            }
        }
        self.tags.remove(CONCAT_TAG);
        Event::Message {
            from: self.from,
            target: self.target,
            text: self.parts.join("\n"),
            tags: self.tags,
            kind: self.kind,
            self_authored: self.self_authored,
        }
    }
}

/// Open multiline buffers for every server.
pub struct MultilineFolder {
    buffers: DashMap<FoldKey, Buffer>,
    ttl: Duration,
}

impl MultilineFolder {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buffers: DashMap::new(),
            ttl,
        }
    }

    /// Feed a message event. Returns `None` while a chain is buffering.
    ///
    /// Non-message events and messages without a `batch` tag are returned
    /// unchanged.
    pub fn fold(&self, server: &ServerId, event: Event, now: Instant) -> Option<Event> {
        let (from, target, text, tags, kind, self_authored) = match event {
            Event::Message {
                from,
                target,
                text,
                tags,
                kind,
                self_authored,
            } => (from, target, text, tags, kind, self_authored),
            other => return Some(other),
        };
        let Some(batch) = tags.get("batch").map(String::from) else {
            return Some(Event::Message {
                from,
                target,
                text,
                tags,
                kind,
                self_authored,
            });
        };

        let key = FoldKey {
            server: server.clone(),
            batch,
            kind,
            sender: irc_lower(&from),
            target: irc_lower(&target),
        };

        if tags.contains(CONCAT_TAG) {
            self.buffers
                .entry(key)
                .and_modify(|buf| buf.parts.push(text.clone()))
                .or_insert_with(|| Buffer {
                    from,
                    target,
                    kind,
                    self_authored,
                    parts: vec![text],
                    tags,
                    first_seen: now,
                });
            return None;
        }

        match self.buffers.remove(&key) {
            Some((_, buf)) => Some(buf.into_event(Some((text, &tags)))),
            None => Some(Event::Message {
                from,
                target,
                text,
                tags,
                kind,
                self_authored,
            }),
        }
    }

    /// Flush chains left open when their batch closes.
    pub fn flush_batch(&self, server: &ServerId, batch: &str) -> Vec<Event> {
        let keys: Vec<FoldKey> = self
            .buffers
            .iter()
            .filter(|e| &e.key().server == server && e.key().batch == batch)
            .map(|e| e.key().clone())
            .collect();
        let mut out: Vec<(Instant, Event)> = keys
            .into_iter()
            .filter_map(|k| self.buffers.remove(&k))
            .map(|(_, buf)| (buf.first_seen, buf.into_event(None)))
            .collect();
        out.sort_by_key(|(seen, _)| *seen);
        out.into_iter().map(|(_, ev)| ev).collect()
    }

    /// Drop buffers idle longer than the TTL. Returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|key, buf| {
            let keep = now.duration_since(buf.first_seen) < self.ttl;
            if !keep {
                tracing::debug!(server = %key.server, batch = %key.batch, "Pruning stale multiline buffer");
            }
            keep
        });
        before - self.buffers.len()
    }

    pub fn clear_server(&self, server: &ServerId) {
        self.buffers.retain(|key, _| &key.server != server);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
