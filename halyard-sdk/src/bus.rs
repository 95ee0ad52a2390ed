//! Ordered multi-subscriber event bus.
//!
//! Publication takes one lock across sequence assignment and fan-out, so
//! every subscriber observes events in the same order even when producers
//! run on different tasks. Each subscriber owns an unbounded queue: a slow
//! consumer buffers instead of stalling the producer.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::event::{Event, ServerEvent, ServerId};

#[derive(Default)]
struct BusState {
    next_seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<ServerEvent>>,
    closed: bool,
}

/// Process-wide bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event published from now on.
    ///
    /// Subscribing to a closed bus returns a stream that ends immediately.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if !state.closed {
            state.subscribers.push(tx);
        }
        EventStream { rx }
    }

    /// Publish an event and return its sequence number.
    pub fn publish(&self, server: &ServerId, event: Event) -> u64 {
        let mut state = self.state.lock();
        Self::publish_locked(&mut state, server, event)
    }

    fn publish_locked(state: &mut BusState, server: &ServerId, event: Event) -> u64 {
        let seq = state.next_seq;
        state.next_seq += 1;
        let ev = ServerEvent {
            server: server.clone(),
            seq,
            event,
        };
        state.subscribers.retain(|tx| tx.send(ev.clone()).is_ok());
        seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Drop every subscription; their streams end once drained.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }
}

/// Per-server view of the global bus.
///
/// Events published here go to the global bus and to this server's own
/// subscribers with the same sequence number.
#[derive(Clone)]
pub struct ServerBus {
    server: ServerId,
    global: EventBus,
    local: Arc<Mutex<Vec<mpsc::UnboundedSender<ServerEvent>>>>,
}

impl ServerBus {
    pub fn new(server: ServerId, global: EventBus) -> Self {
        Self {
            server,
            global,
            local: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local.lock().push(tx);
        EventStream { rx }
    }

    pub fn publish(&self, event: Event) -> u64 {
        let mut local = self.local.lock();
        let mut global = self.global.state.lock();
        if local.is_empty() {
            return EventBus::publish_locked(&mut global, &self.server, event);
        }
        let seq = EventBus::publish_locked(&mut global, &self.server, event.clone());
        drop(global);
        let ev = ServerEvent {
            server: self.server.clone(),
            seq,
            event,
        };
        local.retain(|tx| tx.send(ev.clone()).is_ok());
        seq
    }

    /// End this server's own subscriptions. The global bus is untouched.
    pub fn close(&self) {
        self.local.lock().clear();
    }
}

/// Receiving end of a bus subscription.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = ServerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn note(text: &str) -> Event {
        Event::ServerNotice {
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn subscribers_see_same_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let id = ServerId::from("s1");
        for i in 0..5 {
            bus.publish(&id, note(&i.to_string()));
        }
        for i in 0..5u64 {
            let ea = a.recv().await.unwrap();
            let eb = b.recv().await.unwrap();
            assert_eq!(ea.seq, i);
            assert_eq!(eb.seq, i);
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        drop(a);
        bus.publish(&ServerId::from("s"), note("x"));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn server_bus_feeds_global_and_local() {
        let global = EventBus::new();
        let mut all = global.subscribe();
        let sb = ServerBus::new(ServerId::from("libera"), global.clone());
        let mut mine = sb.subscribe();
        global.publish(&ServerId::from("oftc"), note("other"));
        sb.publish(note("mine"));

        let first = all.next().await.unwrap();
        assert_eq!(first.server.as_str(), "oftc");
        let second = all.next().await.unwrap();
        assert_eq!(second.server.as_str(), "libera");

        let local = mine.recv().await.unwrap();
        assert_eq!(local.seq, second.seq);
        assert!(mine.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let bus = EventBus::new();
        let mut s = bus.subscribe();
        bus.publish(&ServerId::from("s"), note("last"));
        bus.close();
        assert!(s.recv().await.is_some());
        assert!(s.recv().await.is_none());
    }
}
