//! Duplicate suppression for replayed history.
//!
//! Every timestamped message is fingerprinted. A message delivered inside
//! a `chathistory` batch whose fingerprint is already known is dropped.
//! Fingerprints live in a per-server LRU bounded by capacity and age.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::event::{Event, MessageKind, ServerId};
use crate::irc::irc_lower;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub time: String,
    pub kind: MessageKind,
    pub sender: String,
    pub text: String,
}

impl Fingerprint {
    /// Fingerprint of a message event carrying a `time` tag.
    pub fn of(event: &Event) -> Option<Self> {
        let Event::Message {
            from,
            text,
            tags,
            kind,
            ..
        } = event
        else {
            return None;
        };
        Some(Self {
            time: tags.get("time")?.to_string(),
            kind: *kind,
            sender: irc_lower(from),
            text: text.clone(),
        })
    }
}

/// LRU set with insertion instants. Touching an entry moves it to the back.
#[derive(Debug, Default)]
struct RecentSet {
    stamps: HashMap<Fingerprint, (u64, Instant)>,
    order: VecDeque<(u64, Fingerprint)>,
    next_stamp: u64,
}

impl RecentSet {
    fn touch(&mut self, fp: Fingerprint, now: Instant) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.stamps.insert(fp.clone(), (stamp, now));
        self.order.push_back((stamp, fp));
    }

    fn contains(&self, fp: &Fingerprint) -> bool {
        self.stamps.contains_key(fp)
    }

    /// Drop entries over capacity or older than `max_age`.
    fn prune(&mut self, capacity: usize, max_age: Duration, now: Instant) {
        while let Some((stamp, fp)) = self.order.front() {
            let live = self.stamps.get(fp).copied();
            match live {
                // Superseded by a later touch.
                Some((current, _)) if current != *stamp => {
                    self.order.pop_front();
                }
                Some((_, seen)) if self.stamps.len() > capacity || now.duration_since(seen) >= max_age => {
                    let fp = fp.clone();
                    self.stamps.remove(&fp);
                    self.order.pop_front();
                }
                None => {
                    self.order.pop_front();
                }
                Some(_) => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.stamps.len()
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.order.len()
    }
}

pub struct HistoryDedup {
    recent: DashMap<ServerId, RecentSet>,
    history_batches: DashMap<ServerId, HashSet<String>>,
    capacity: usize,
    max_age: Duration,
}

fn is_history_batch(batch_type: &str) -> bool {
    batch_type.eq_ignore_ascii_case("chathistory") || batch_type.eq_ignore_ascii_case("draft/chathistory")
}

impl HistoryDedup {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            recent: DashMap::new(),
            history_batches: DashMap::new(),
            capacity: capacity.max(1),
            max_age,
        }
    }

    pub fn batch_started(&self, server: &ServerId, id: &str, batch_type: &str) {
        if is_history_batch(batch_type) {
            self.history_batches
                .entry(server.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    pub fn batch_ended(&self, server: &ServerId, id: &str) {
        if let Some(mut set) = self.history_batches.get_mut(server) {
            set.remove(id);
        }
    }

    fn in_history_batch(&self, server: &ServerId, event: &Event) -> bool {
        let Some(batch) = event.tags().and_then(|t| t.get("batch")) else {
            return false;
        };
        self.history_batches
            .get(server)
            .is_some_and(|set| set.contains(batch))
    }

    /// Record `event` and report whether it is a replayed duplicate.
    pub fn is_duplicate(&self, server: &ServerId, event: &Event, now: Instant) -> bool {
        let Some(fp) = Fingerprint::of(event) else {
            return false;
        };
        let replayed = self.in_history_batch(server, event);
        let mut recent = self.recent.entry(server.clone()).or_default();
        let duplicate = replayed && recent.contains(&fp);
        if duplicate {
            tracing::trace!(server = %server, time = %fp.time, "Suppressing duplicate history line");
        }
        recent.touch(fp, now);
        recent.prune(self.capacity, self.max_age, now);
        duplicate
    }

    pub fn sweep(&self, now: Instant) {
        for mut set in self.recent.iter_mut() {
            set.prune(self.capacity, self.max_age, now);
        }
        self.recent.retain(|_, set| !set.stamps.is_empty());
    }

    /// Forget open history batches of `server`. Fingerprints age out on
    /// their own so a replay after reconnect is still deduplicated.
    pub fn clear_server(&self, server: &ServerId) {
        self.history_batches.remove(server);
    }

    pub fn len(&self, server: &ServerId) -> usize {
        self.recent.get(server).map_or(0, |s| s.len())
    }
}
