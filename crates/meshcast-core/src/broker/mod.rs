//! In-process publish/subscribe fabric keyed by (topic, detail).
//!
//! Components never call each other directly; they publish events here and
//! subscribe to what they care about. Each subscription owns a bounded
//! single-slot queue, and delivery is best-effort with a one-second
//! per-subscriber cap so one stalled consumer cannot head-of-line block the
//! rest.

mod channel;
mod subscription;

pub use subscription::Subscription;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::message::Message;
use channel::Channel;

/// Message topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Per-client socket deliveries, targeted via [`Detail::socket`].
    ClientSocket,
    /// Client lifecycle and requests published by the signal controller.
    Client,
    /// Media server commands and state transitions.
    Media,
    /// Client-reported peer connection state.
    Peer,
    /// Classification probe outcomes.
    Classification,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::ClientSocket => "ClientSocket",
            Topic::Client => "Client",
            Topic::Media => "Media",
            Topic::Peer => "Peer",
            Topic::Classification => "Classification",
        };
        f.write_str(name)
    }
}

/// Message detail within a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Detail {
    Activate,
    Deactivate,
    Push,
    Pull,
    Upstream,
    Downstream,
    Connected,
    Disconnected,
    Failed,
    Clear,
    Close,
    Classify,
    Classified,
    /// Targets a single socket; the payload is `channel_id + client_id`.
    Socket(String),
}

impl Detail {
    /// Detail addressing one client's socket.
    pub fn socket(channel_id: &str, client_id: &str) -> Self {
        Detail::Socket(format!("{channel_id}{client_id}"))
    }
}

impl fmt::Display for Detail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detail::Activate => f.write_str("ACTIVATE"),
            Detail::Deactivate => f.write_str("DEACTIVATE"),
            Detail::Push => f.write_str("PUSH"),
            Detail::Pull => f.write_str("PULL"),
            Detail::Upstream => f.write_str("UPSTREAM"),
            Detail::Downstream => f.write_str("DOWNSTREAM"),
            Detail::Connected => f.write_str("CONNECTED"),
            Detail::Disconnected => f.write_str("DISCONNECTED"),
            Detail::Failed => f.write_str("FAILED"),
            Detail::Clear => f.write_str("CLEAR"),
            Detail::Close => f.write_str("CLOSE"),
            Detail::Classify => f.write_str("CLASSIFY"),
            Detail::Classified => f.write_str("CLASSIFIED"),
            Detail::Socket(key) => write!(f, "{key}"),
        }
    }
}

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Publishing or unsubscribing on a (topic, detail) pair nobody ever
    /// subscribed to.
    #[error("no channel exists for topic {topic} and detail {detail}")]
    ChannelNotFound { topic: Topic, detail: Detail },
}

/// The broker. Cheap to share behind an `Arc`.
pub struct Broker {
    channels: RwLock<HashMap<(Topic, Detail), Arc<Channel>>>,
    next_subscription_id: AtomicU64,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a (topic, detail) pair, lazily creating its channel.
    pub async fn subscribe(&self, topic: Topic, detail: Detail) -> Subscription {
        let channel = self.ensure_channel(topic, detail).await;
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        channel.add_subscription(id).await
    }

    /// Deliver `message` to every current subscriber of the pair.
    pub async fn publish(
        &self,
        topic: Topic,
        detail: Detail,
        message: Message,
    ) -> Result<(), BrokerError> {
        let channel = self.get_channel(topic, detail).await?;
        channel.send_all(message).await;
        Ok(())
    }

    /// Remove `sub` from the pair and close its queue.
    pub async fn unsubscribe(
        &self,
        topic: Topic,
        detail: Detail,
        sub: &Subscription,
    ) -> Result<(), BrokerError> {
        let channel = self.get_channel(topic, detail).await?;
        channel.remove_subscription(sub.id()).await;
        Ok(())
    }

    async fn ensure_channel(&self, topic: Topic, detail: Detail) -> Arc<Channel> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&(topic, detail.clone())) {
                return Arc::clone(channel);
            }
        }

        let mut channels = self.channels.write().await;
        let channel = channels
            .entry((topic, detail.clone()))
            .or_insert_with(|| Arc::new(Channel::new(topic.to_string(), detail.to_string())));
        Arc::clone(channel)
    }

    async fn get_channel(&self, topic: Topic, detail: Detail) -> Result<Arc<Channel>, BrokerError> {
        let channels = self.channels.read().await;
        channels
            .get(&(topic, detail.clone()))
            .cloned()
            .ok_or(BrokerError::ChannelNotFound { topic, detail })
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
