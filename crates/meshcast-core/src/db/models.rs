//! Row types for channels, clients, and connections.

use sha2::{Digest, Sha256};

/// Pseudo-identity of the media server. Fills `from` on pull connections and
/// `to` on push connections.
pub const MEDIA_SERVER_ID: &str = "media-server-id";

/// Debug/test channel seeded when the default-channel flag is set.
pub const DEFAULT_CHANNEL_ID: &str = "7";
pub const DEFAULT_CHANNEL_KEY: &str = "7";

/// A stream identity with one publisher and many viewers.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChannelInfo {
    pub id: String,
    pub key: String,
    pub created_at: i64,
}

impl ChannelInfo {
    /// Shared-key check. Comparing digests keeps the comparison independent
    /// of how many leading bytes match.
    pub fn authenticate(&self, key: &str) -> bool {
        Sha256::digest(self.key.as_bytes()) == Sha256::digest(key.as_bytes())
    }
}

/// Classification of a viewer within its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum ClientClass {
    /// Not yet classified; eligible for probing.
    Candidate,
    /// Proven able to serve fetchers over peer connections.
    Forwarder,
    /// Consumes the stream; not currently a forwarding candidate.
    Fetcher,
}

/// A connected client.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClientInfo {
    pub id: String,
    pub channel_id: String,
    pub class: ClientClass,
    pub created_at: i64,
}

/// Connection shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum ConnectionKind {
    PushToServer,
    PullFromServer,
    PeerToPeer,
    Classify,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Initialized,
    Connected,
}

/// A signaling-tracked connection: client to media server or client to
/// client.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ConnectionInfo {
    pub id: String,
    pub channel_id: String,
    pub from_id: String,
    pub to_id: String,
    pub kind: ConnectionKind,
    pub status: ConnectionStatus,
    pub created_at: i64,
    pub connected_at: Option<i64>,
}

impl ConnectionInfo {
    pub fn is_upstream(&self) -> bool {
        self.kind == ConnectionKind::PushToServer
    }

    pub fn is_downstream(&self) -> bool {
        self.kind == ConnectionKind::PullFromServer
    }

    pub fn is_peer(&self) -> bool {
        self.kind == ConnectionKind::PeerToPeer
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Whether `client_id` may act on this connection within `channel_id`.
    pub fn authorize(&self, channel_id: &str, client_id: &str) -> bool {
        self.channel_id == channel_id && (self.to_id == client_id || self.from_id == client_id)
    }

    /// The other endpoint of this connection.
    pub fn counterpart(&self, client_id: &str) -> &str {
        if self.to_id == client_id {
            &self.from_id
        } else {
            &self.to_id
        }
    }
}
