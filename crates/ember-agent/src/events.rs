//! Fan-out event channels for log lines and runtime progress.
//!
//! Publishing never waits on subscribers: a subscriber that falls more than
//! the channel capacity behind loses the oldest events. Subscribers only see
//! events published after they subscribed.

use tokio::sync::broadcast;

pub const LOG_CHANNEL_CAPACITY: usize = 1000;
pub const PROGRESS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` to every current subscriber.
    pub fn publish(&self, event: T) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of an [`EventBus`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T: Clone> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(v) => return Some(v),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged; dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-published event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(v) => return Some(v),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
