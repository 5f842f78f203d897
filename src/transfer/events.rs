//! Transfer Event Bus
//!
//! Push path from the worker and coordinator to observers. Events are
//! hints: the record store stays authoritative, and a receiver that lags
//! re-reads the store instead of replaying what it missed.

use tokio::sync::broadcast;
use tracing::trace;

use super::state::TransferState;
use super::types::TransferId;

/// Default broadcast buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    StateChanged {
        id: TransferId,
        state: TransferState,
    },
    ProgressChanged {
        id: TransferId,
        bytes_current: u64,
        bytes_total: u64,
    },
    Error {
        id: TransferId,
        message: String,
    },
}

impl TransferEvent {
    pub fn id(&self) -> TransferId {
        match self {
            TransferEvent::StateChanged { id, .. }
            | TransferEvent::ProgressChanged { id, .. }
            | TransferEvent::Error { id, .. } => *id,
        }
    }
}

/// Broadcast sender shared by everything that changes records
#[derive(Clone)]
pub struct TransferEvents {
    tx: broadcast::Sender<TransferEvent>,
}

impl TransferEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; having none is not an error
    pub fn publish(&self, event: TransferEvent) {
        trace!(?event, "publish");
        let _ = self.tx.send(event);
    }

    pub fn state_changed(&self, id: TransferId, state: TransferState) {
        self.publish(TransferEvent::StateChanged { id, state });
    }

    pub fn progress(&self, id: TransferId, bytes_current: u64, bytes_total: u64) {
        self.publish(TransferEvent::ProgressChanged {
            id,
            bytes_current,
            bytes_total,
        });
    }

    pub fn error(&self, id: TransferId, message: impl Into<String>) {
        self.publish(TransferEvent::Error {
            id,
            message: message.into(),
        });
    }
}

impl Default for TransferEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let events = TransferEvents::new(8);
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        events.state_changed(3, TransferState::InProgress);
        events.progress(3, 10, 20);

        for rx in [&mut a, &mut b] {
            assert_eq!(
                rx.recv().await.unwrap(),
                TransferEvent::StateChanged {
                    id: 3,
                    state: TransferState::InProgress
                }
            );
            assert_eq!(rx.recv().await.unwrap().id(), 3);
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let events = TransferEvents::default();
        events.error(1, "nobody listening");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let events = TransferEvents::new(2);
        let mut rx = events.subscribe();
        for n in 0..5 {
            events.progress(1, n, 10);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
