/*!
 * Progress event publisher (spec §6 "Events emitted"): `ItemStarted` when
 * the driver picks up an entry, `ItemFinished` when the finisher disposes of
 * it, `StateChanged` bracketing folder state transitions. A plain
 * publish-subscribe channel over a bounded set of subscribers.
 */

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::index::FolderState;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ItemStarted { folder: String, item: String },
    ItemFinished { folder: String, item: String, error: Option<String> },
    StateChanged { folder: String, state: FolderState },
}

/// Sends events to a subscriber; cloneable so every worker can hold one.
#[derive(Clone)]
pub struct ProgressPublisher {
    sender: Option<Sender<ProgressEvent>>,
}

impl ProgressPublisher {
    pub fn new() -> (Self, ProgressSubscriber) {
        let (tx, rx) = unbounded();
        (Self { sender: Some(tx) }, ProgressSubscriber { receiver: rx })
    }

    /// A publisher with no subscriber attached; every publish is a no-op.
    pub fn noop() -> Self {
        Self { sender: None }
    }

    pub fn publish(&self, event: ProgressEvent) {
        if let Some(tx) = &self.sender {
            let _ = tx.send(event);
        }
    }

    pub fn item_started(&self, folder: &str, item: &str) {
        self.publish(ProgressEvent::ItemStarted {
            folder: folder.to_string(),
            item: item.to_string(),
        });
    }

    pub fn item_finished(&self, folder: &str, item: &str, error: Option<String>) {
        self.publish(ProgressEvent::ItemFinished {
            folder: folder.to_string(),
            item: item.to_string(),
            error,
        });
    }

    pub fn state_changed(&self, folder: &str, state: FolderState) {
        self.publish(ProgressEvent::StateChanged {
            folder: folder.to_string(),
            state,
        });
    }
}

pub struct ProgressSubscriber {
    receiver: Receiver<ProgressEvent>,
}

impl ProgressSubscriber {
    pub fn try_recv(&self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn recv(&self) -> Option<ProgressEvent> {
        self.receiver.recv().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = ProgressEvent> + '_ {
        self.receiver.try_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_does_not_panic() {
        let p = ProgressPublisher::noop();
        p.item_started("f", "a/b");
    }

    #[test]
    fn subscriber_receives_published_events() {
        let (publisher, subscriber) = ProgressPublisher::new();
        publisher.item_started("f", "a/b");
        publisher.item_finished("f", "a/b", None);
        match subscriber.recv() {
            Some(ProgressEvent::ItemStarted { folder, item }) => {
                assert_eq!(folder, "f");
                assert_eq!(item, "a/b");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            subscriber.recv(),
            Some(ProgressEvent::ItemFinished { .. })
        ));
    }
}
