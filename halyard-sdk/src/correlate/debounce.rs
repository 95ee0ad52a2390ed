//! Netsplit inference and debounce.
//!
//! A split shows up as a burst of QUITs whose reason is the two server
//! names. One notification is raised per (server, split pair) per window.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::event::ServerId;

fn is_server_name(token: &str) -> bool {
    token.contains('.')
        && !token.starts_with('.')
        && !token.ends_with('.')
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'))
}

/// Split pair from a quit reason shaped like `hub.example.net leaf.example.net`.
pub fn parse_netsplit_reason(reason: &str) -> Option<(String, String)> {
    let mut parts = reason.split(' ');
    let a = parts.next()?;
    let b = parts.next()?;
    if parts.next().is_some() || !is_server_name(a) || !is_server_name(b) {
        return None;
    }
    if a.eq_ignore_ascii_case(b) {
        return None;
    }
    Some((a.to_string(), b.to_string()))
}

pub struct NetsplitDebounce {
    last_notified: DashMap<(ServerId, String), Instant>,
    window: Duration,
    cap: usize,
}

impl NetsplitDebounce {
    pub fn new(window: Duration, cap: usize) -> Self {
        Self {
            last_notified: DashMap::new(),
            window,
            cap: cap.max(2),
        }
    }

    fn pair_key(a: &str, b: &str) -> String {
        let mut pair = [a.to_ascii_lowercase(), b.to_ascii_lowercase()];
        pair.sort();
        pair.join(" ")
    }

    /// True if this split should be announced now.
    pub fn should_notify(&self, server: &ServerId, a: &str, b: &str, now: Instant) -> bool {
        let key = (server.clone(), Self::pair_key(a, b));
        if let Some(last) = self.last_notified.get(&key)
            && now.duration_since(*last) < self.window
        {
            return false;
        }
        self.last_notified.insert(key, now);
        if self.last_notified.len() > self.cap {
            self.trim_oldest_half();
        }
        true
    }

    fn trim_oldest_half(&self) {
        let mut entries: Vec<((ServerId, String), Instant)> = self
            .last_notified
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by_key(|(_, at)| *at);
        let drop = entries.len() / 2;
        for (key, _) in entries.into_iter().take(drop) {
            self.last_notified.remove(&key);
        }
        tracing::debug!(removed = drop, "Trimmed netsplit debounce table");
    }

    pub fn clear_server(&self, server: &ServerId) {
        self.last_notified.retain(|(s, _), _| s != server);
    }

    pub fn len(&self) -> usize {
        self.last_notified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_notified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_split_reasons() {
        assert_eq!(
            parse_netsplit_reason("hub.example.net leaf.example.net"),
            Some(("hub.example.net".into(), "leaf.example.net".into()))
        );
        assert!(parse_netsplit_reason("Quit: bye").is_none());
        assert!(parse_netsplit_reason("Ping timeout: 240 seconds").is_none());
        assert!(parse_netsplit_reason("a.net a.net").is_none());
        assert!(parse_netsplit_reason("*.net *.split").is_some());
        assert!(parse_netsplit_reason("one.two three.four five.six").is_none());
    }

    #[test]
    fn cascade_notifies_once_per_window() {
        let d = NetsplitDebounce::new(Duration::from_secs(30), 256);
        let s = ServerId::from("net");
        let t0 = Instant::now();
        assert!(d.should_notify(&s, "a.net", "b.net", t0));
        for i in 1..50 {
            assert!(!d.should_notify(&s, "b.net", "A.net", t0 + Duration::from_millis(i * 10)));
        }
        assert!(d.should_notify(&s, "a.net", "b.net", t0 + Duration::from_secs(30)));
        // Another server has its own table entries.
        assert!(d.should_notify(&ServerId::from("other"), "a.net", "b.net", t0));
    }

    #[test]
    fn trims_oldest_half_over_cap() {
        let d = NetsplitDebounce::new(Duration::from_secs(30), 4);
        let s = ServerId::from("net");
        let t0 = Instant::now();
        for i in 0..5u64 {
            d.should_notify(&s, &format!("h{i}.net"), "x.net", t0 + Duration::from_secs(i));
        }
        assert_eq!(d.len(), 3);
        // The newest entry survived.
        assert!(!d.should_notify(&s, "h4.net", "x.net", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn clear_server_is_scoped() {
        let d = NetsplitDebounce::new(Duration::from_secs(30), 256);
        let now = Instant::now();
        d.should_notify(&ServerId::from("a"), "x.net", "y.net", now);
        d.should_notify(&ServerId::from("b"), "x.net", "y.net", now);
        d.clear_server(&ServerId::from("a"));
        assert_eq!(d.len(), 1);
    }
}
