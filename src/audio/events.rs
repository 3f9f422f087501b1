//! Pipeline lifecycle notifications
//!
//! Handlers run synchronously on whichever thread raised the event, which
//! for `DeviceLost` is the stream holder thread. Keep them short.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::device::Direction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Started { direction: Direction, device: String },
    Stopped { direction: Direction },
    /// The hardware went away; the pipeline is already idle
    DeviceLost {
        direction: Direction,
        device: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Fan-out of pipeline events to subscribers
#[derive(Default)]
pub struct EventHub {
    handlers: Mutex<Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    pub fn emit(&self, event: &PipelineEvent) {
        // Snapshot so handlers may (un)subscribe
        let handlers: Vec<Handler> = self.handlers.lock().iter().map(|(_, h)| h.clone()).collect();
        tracing::debug!(?event, subscribers = handlers.len(), "Pipeline event");
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let hub = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = hub.subscribe(move |event| {
            if matches!(event, PipelineEvent::Stopped { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        hub.emit(&PipelineEvent::Stopped {
            direction: Direction::Input,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(&PipelineEvent::Stopped {
            direction: Direction::Input,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let hub = Arc::new(EventHub::new());
        let inner = hub.clone();
        hub.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        hub.emit(&PipelineEvent::Stopped {
            direction: Direction::Output,
        });
        assert_eq!(hub.subscriber_count(), 2);
    }
}
