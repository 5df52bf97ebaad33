//! Internal event messages carried by the broker.
//!
//! Every payload published on a broker channel is a [`Message`] variant.
//! Handlers match on the variant they expect and log a warning on anything
//! else; a mismatched variant is a programming error, not a protocol one.

use crate::wire::ServerFrame;

/// A client finished socket authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activate {
    pub channel_id: String,
    pub client_id: String,
}

/// A client socket went away. The socket is the single source of truth for
/// client liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deactivate {
    pub channel_id: String,
    pub client_id: String,
}

/// A client requests to push its stream to the media server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub connection_id: String,
    pub channel_id: String,
    pub client_id: String,
    pub sdp: String,
}

/// A client requests to pull the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pull {
    pub connection_id: String,
    pub channel_id: String,
    pub client_id: String,
    pub sdp: String,
}

/// Instruct the media façade to accept an inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub connection_id: String,
    /// ClientSocket detail (`channel_id + client_id`) the SDP answer goes to.
    pub key: String,
    pub sdp: String,
}

/// Instruct the media façade to fan the named stream out to a new viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downstream {
    pub connection_id: String,
    /// Connection id of the channel's upstream, which keys the shared track.
    pub stream_id: String,
    pub key: String,
    pub sdp: String,
}

/// A connection reached the Connected state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub connection_id: String,
}

/// A connection reported Disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub connection_id: String,
}

/// A peer connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failed {
    pub connection_id: String,
}

/// Close one media connection and forget it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clear {
    pub connection_id: String,
}

/// Close an upstream connection and drop its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub connection_id: String,
}

/// Outcome of a classification probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub connection_id: String,
    pub channel_id: String,
    pub success: bool,
}

/// The broker payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Activate(Activate),
    Deactivate(Deactivate),
    Push(Push),
    Pull(Pull),
    Upstream(Upstream),
    Downstream(Downstream),
    Connected(Connected),
    Disconnected(Disconnected),
    Failed(Failed),
    Clear(Clear),
    Close(Close),
    Classified(Classified),
    /// A frame destined for a single client socket.
    Frame(ServerFrame),
}
