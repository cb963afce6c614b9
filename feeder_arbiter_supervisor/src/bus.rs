//! Fan-out of `ArbiterEvent`s to loggers and GUIs.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use feeder_arbiter_core::ArbiterEvent;

/// Every subscriber receives every event published after it subscribed.
/// Subscribers that dropped their receiver are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ArbiterEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ArbiterEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ArbiterEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = ArbiterEvent>) {
        for ev in events {
            self.publish(ev);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
