//! A single (topic, detail) delivery channel.

use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::warn;

use super::subscription::Subscription;
use crate::message::Message;

/// How long a publish waits on one subscriber before dropping the delivery.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

struct Slot {
    id: u64,
    tx: mpsc::Sender<Message>,
}

/// Fans one message out to every current subscriber of a (topic, detail)
/// pair. Delivery is best-effort: a full queue stalls only its own
/// subscriber, and only up to [`DELIVERY_TIMEOUT`].
pub(crate) struct Channel {
    topic: String,
    detail: String,
    subs: Mutex<Vec<Slot>>,
}

impl Channel {
    pub(crate) fn new(topic: String, detail: String) -> Self {
        Self {
            topic,
            detail,
            subs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn send_all(&self, message: Message) {
        // Snapshot the senders so a slow delivery does not hold the list
        // lock against subscribe/unsubscribe.
        let senders: Vec<(u64, mpsc::Sender<Message>)> = {
            let subs = self.subs.lock().await;
            subs.iter().map(|s| (s.id, s.tx.clone())).collect()
        };

        for (id, tx) in senders {
            match timeout(DELIVERY_TIMEOUT, tx.send(message.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    warn!(
                        topic = %self.topic,
                        detail = %self.detail,
                        subscription = id,
                        "Dropped delivery to closed subscription"
                    );
                }
                Err(_) => {
                    warn!(
                        topic = %self.topic,
                        detail = %self.detail,
                        subscription = id,
                        "Delivery timed out, message dropped for slow subscriber"
                    );
                }
            }
        }
    }

    pub(crate) async fn add_subscription(&self, id: u64) -> Subscription {
        let (sub, tx) = Subscription::new(id);
        self.subs.lock().await.push(Slot { id, tx });
        sub
    }

    /// Removes the subscription's write side; the reader then sees `None`.
    pub(crate) async fn remove_subscription(&self, id: u64) {
        self.subs.lock().await.retain(|s| s.id != id);
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self) -> usize {
        self.subs.lock().await.len()
    }
}
