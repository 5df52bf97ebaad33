//! Subscription handle over a bounded single-slot queue.

use tokio::sync::mpsc;

use crate::message::Message;

/// Capacity of every subscription queue. A subscriber that has not drained
/// its slot blocks delivery until the broker's per-subscriber timeout fires.
pub(crate) const QUEUE_CAPACITY: usize = 1;

/// The read side of a broker subscription.
///
/// The broker holds the matching write side; dropping either half closes the
/// queue, and readers must tolerate a closed queue (`recv` returns `None`).
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(id: u64) -> (Self, mpsc::Sender<Message>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { id, rx }, tx)
    }

    /// Receive the next message, or `None` once the broker has closed the
    /// queue via unsubscribe.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<Message, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Identity used by the broker to remove this subscription.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Connected, Message};

    #[tokio::test]
    async fn recv_returns_queued_message() {
        let (mut sub, tx) = Subscription::new(1);
        tx.send(Message::Connected(Connected {
            connection_id: "c1".into(),
        }))
        .await
        .unwrap();

        let msg = sub.recv().await.unwrap();
        assert!(matches!(msg, Message::Connected(c) if c.connection_id == "c1"));
    }

    #[tokio::test]
    async fn recv_returns_none_after_close() {
        let (mut sub, tx) = Subscription::new(1);
        drop(tx);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn queue_holds_a_single_message() {
        let (_sub, tx) = Subscription::new(1);
        tx.try_send(Message::Connected(Connected {
            connection_id: "c1".into(),
        }))
        .unwrap();
        let err = tx.try_send(Message::Connected(Connected {
            connection_id: "c2".into(),
        }));
        assert!(err.is_err());
    }
}
