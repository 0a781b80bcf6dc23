//! Per-manager event bus. Grounded on the teacher's
//! `process::broadcaster::ServerEventBroadcaster`, but deliberately
//! instance-scoped rather than a `LazyLock` singleton, so that every
//! piece of "global" state is owned by the `ProxyManager` value that
//! created it — unlike the teacher's single-app GUI, a test process
//! here may construct more than one independent manager side by side.

use std::sync::Arc;

use switchboard_core::{Event, EventSink};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// A `tokio::sync::broadcast`-backed [`EventSink`]. Full or absent
/// subscribers never block a producer: `broadcast::Sender::send` only
/// fails (silently dropped here) when there are no receivers at all, and
/// a lagging receiver simply skips ahead on its next `recv`.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self { sender })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: Event) {
        if self.sender.receiver_count() > 0 {
            debug!(?event, "emitting event");
            let _ = self.sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::ProcessState;
    use std::time::SystemTime;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::StateChanged {
            model: "m1".into(),
            from: ProcessState::Stopped,
            to: ProcessState::Starting,
            at: SystemTime::now(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::StateChanged { model, .. } if model == "m1"));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(Event::StateChanged {
            model: "m1".into(),
            from: ProcessState::Stopped,
            to: ProcessState::Starting,
            at: SystemTime::now(),
        });
    }
}
