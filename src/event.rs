//! Pub/sub for lifecycle events.

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Default buffered events per subscriber before the slowest one lags.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Broadcast publisher that can be closed.
///
/// After [`close`](Self::close), publishing is a no-op and subscribers see the
/// stream end.
pub struct EventPublisher<E: Clone> {
    tx: Mutex<Option<broadcast::Sender<E>>>,
}

impl<E: Clone + Send + 'static> EventPublisher<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Deliver `event` to current subscribers. Returns the number reached.
    pub fn publish(&self, event: E) -> usize {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to future events. `None` once closed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<E>> {
        self.tx.lock().as_ref().map(|tx| tx.subscribe())
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl<E: Clone + Send + 'static> Default for EventPublisher<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_close() {
        let publisher: EventPublisher<u32> = EventPublisher::new();
        assert_eq!(publisher.publish(1), 0);

        let mut rx = publisher.subscribe().unwrap();
        assert_eq!(publisher.publish(2), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);

        publisher.close();
        assert!(publisher.is_closed());
        assert!(publisher.subscribe().is_none());
        assert_eq!(publisher.publish(3), 0);
        assert!(rx.recv().await.is_err());
    }
}
