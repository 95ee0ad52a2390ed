//! Labeled-response correlation.
//!
//! A request written with `@label=` is recorded with the context it came
//! from. A reply carrying the same label, or the end of a
//! `labeled-response` batch bound to it, completes the request if it
//! arrives strictly inside the correlation window. Anything still pending
//! at the timeout is reported as timed out. Completion and timeout both
//! remove the entry, so a label resolves at most once.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::event::{Event, LabelOutcome, ReplySeverity, ServerId};

/// A request waiting for its labeled reply.
#[derive(Debug, Clone)]
pub struct PendingLabel {
    pub context: String,
    pub preview: String,
    pub outcome: LabelOutcome,
    pub created: Instant,
    /// Batch the reply is being delivered in, once bound.
    pub batch: Option<String>,
}

pub struct LabelTracker {
    pending: DashMap<(ServerId, String), PendingLabel>,
    /// `labeled-response` batch id → label.
    batches: DashMap<(ServerId, String), String>,
    window: Duration,
    timeout: Duration,
}

/// Failure replies complete a label with [`LabelOutcome::Failure`].
fn outcome_of(event: &Event) -> LabelOutcome {
    match event {
        Event::StandardReply {
            severity: ReplySeverity::Fail,
            ..
        } => LabelOutcome::Failure,
        Event::Numeric { code, .. } if (400..600).contains(code) => LabelOutcome::Failure,
        _ => LabelOutcome::Success,
    }
}

impl LabelTracker {
    pub fn new(window: Duration, timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            batches: DashMap::new(),
            window,
            timeout,
        }
    }

    pub fn register(&self, server: &ServerId, label: &str, context: &str, preview: &str, now: Instant) {
        self.pending.insert(
            (server.clone(), label.to_string()),
            PendingLabel {
                context: context.to_string(),
                preview: preview.to_string(),
                outcome: LabelOutcome::Pending,
                created: now,
                batch: None,
            },
        );
    }

    pub fn get(&self, server: &ServerId, label: &str) -> Option<PendingLabel> {
        self.pending
            .get(&(server.clone(), label.to_string()))
            .map(|p| p.value().clone())
    }

    fn in_window(&self, pending: &PendingLabel, now: Instant) -> bool {
        now.duration_since(pending.created) < self.window
    }

    /// Correlate one inbound event.
    ///
    /// Returns the event to publish: a [`Event::LabeledReply`] wrapping it
    /// when it completes a request, otherwise the event itself.
    pub fn correlate(&self, server: &ServerId, event: Event, now: Instant) -> Event {
        // Replies inside a bound batch only record failures.
        if let Some(batch) = event.tags().and_then(|t| t.get("batch"))
            && let Some(label) = self.batches.get(&(server.clone(), batch.to_string()))
        {
            if outcome_of(&event) == LabelOutcome::Failure
                && let Some(mut pending) = self.pending.get_mut(&(server.clone(), label.value().clone()))
            {
                pending.outcome = LabelOutcome::Failure;
            }
            return event;
        }

        match event {
            Event::BatchStart {
                ref id,
                ref batch_type,
                ref tags,
                ..
            } if batch_type.eq_ignore_ascii_case("labeled-response") => {
                if let Some(label) = tags.get("label") {
                    let key = (server.clone(), label.to_string());
                    if let Some(mut pending) = self.pending.get_mut(&key)
                        && now.duration_since(pending.created) < self.window
                    {
                        pending.batch = Some(id.clone());
                        self.batches.insert((server.clone(), id.clone()), label.to_string());
                    }
                }
                event
            }
            Event::BatchEnd { ref id, .. } => {
                let Some((_, label)) = self.batches.remove(&(server.clone(), id.clone())) else {
                    return event;
                };
                match self.pending.remove(&(server.clone(), label.clone())) {
                    Some((_, pending)) => {
                        let outcome = match pending.outcome {
                            LabelOutcome::Pending => LabelOutcome::Success,
                            other => other,
                        };
                        tracing::debug!(server = %server, %label, ?outcome, "Labeled batch complete");
                        Event::LabeledReply {
                            label,
                            context: pending.context,
                            preview: pending.preview,
                            outcome,
                            reply: Box::new(event),
                        }
                    }
                    None => event,
                }
            }
            event => {
                let Some(label) = event.tags().and_then(|t| t.get("label")).map(String::from) else {
                    return event;
                };
                let key = (server.clone(), label.clone());
                let matched = self
                    .pending
                    .remove_if(&key, |_, pending| self.in_window(pending, now));
                match matched {
                    Some((_, pending)) => {
                        let outcome = outcome_of(&event);
                        tracing::debug!(server = %server, %label, ?outcome, "Labeled reply matched");
                        Event::LabeledReply {
                            label,
                            context: pending.context,
                            preview: pending.preview,
                            outcome,
                            reply: Box::new(event),
                        }
                    }
                    None => {
                        tracing::debug!(server = %server, %label, "Label reply with no open request");
                        event
                    }
                }
            }
        }
    }

    /// Time out requests pending longer than the timeout.
    pub fn sweep(&self, now: Instant) -> Vec<(ServerId, Event)> {
        let expired: Vec<(ServerId, String)> = self
            .pending
            .iter()
            .filter(|e| now.duration_since(e.value().created) >= self.timeout)
            .map(|e| e.key().clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .map(|((server, label), pending)| self.timed_out(server, label, pending))
            .collect()
    }

    /// Time out every request of `server`.
    pub fn clear_server(&self, server: &ServerId) -> Vec<(ServerId, Event)> {
        self.batches.retain(|(s, _), _| s != server);
        let keys: Vec<(ServerId, String)> = self
            .pending
            .iter()
            .filter(|e| &e.key().0 == server)
            .map(|e| e.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .map(|((server, label), pending)| self.timed_out(server, label, pending))
            .collect()
    }

    fn timed_out(&self, server: ServerId, label: String, pending: PendingLabel) -> (ServerId, Event) {
        if let Some(ref batch) = pending.batch {
            self.batches.remove(&(server.clone(), batch.clone()));
        }
        tracing::debug!(server = %server, %label, "Labeled request timed out");
        (
            server,
            Event::LabeledTimeout {
                label,
                context: pending.context,
                preview: pending.preview,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
