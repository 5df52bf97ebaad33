//! Client wire protocol.
//!
//! All frames are JSON text. Requests use a `{ "type": ..., "payload": ... }`
//! envelope; server frames are flat objects discriminated by `type`. The
//! uppercase tags are part of the protocol and must not change.

use serde::{Deserialize, Serialize};

/// A request read from a client socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientRequest {
    /// First frame on every socket: channel authentication.
    #[serde(rename = "ACTIVATE")]
    Activate {
        channel_id: String,
        channel_key: String,
        client_id: String,
    },

    /// Publisher offers its upstream to the media server. The connection id
    /// is client-generated and adopted by the server.
    #[serde(rename = "PUSH")]
    Push { connection_id: String, sdp: String },

    /// Viewer requests the stream from the media server.
    #[serde(rename = "PULL")]
    Pull { connection_id: String, sdp: String },

    /// Fetcher hands its peer offer to the forwarder on an established
    /// connection id.
    #[serde(rename = "FORWARD")]
    Forward { connection_id: String, sdp: String },

    /// ICE candidate / renegotiation relay to the counterpart.
    #[serde(rename = "SIGNAL")]
    Signal {
        connection_id: String,
        signal_type: String,
        signal_data: String,
    },

    /// Client-reported peer connection state.
    #[serde(rename = "CONNECTED")]
    Connected { connection_id: String },

    #[serde(rename = "DISCONNECTED")]
    Disconnected { connection_id: String },

    #[serde(rename = "FAILED")]
    Failed { connection_id: String },

    /// Outcome of a classification probe, reported by the probed fetcher.
    #[serde(rename = "CLASSIFIED")]
    Classified { connection_id: String, success: bool },
}

/// A frame written to a client socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Authentication outcome.
    #[serde(rename = "ACTIVATE")]
    Activate { message: String },

    /// Carries the server's SDP answer or a relayed peer candidate.
    #[serde(rename = "SIGNAL")]
    Signal {
        connection_id: String,
        signal_type: String,
        signal_data: String,
    },

    /// Tells a fetcher to open a peer connection to a forwarder on the
    /// named connection.
    #[serde(rename = "FORWARD")]
    Forward { connection_id: String },

    /// Tells a forwarder to accept an offer from a fetcher.
    #[serde(rename = "FORWARDING")]
    Forwarding { connection_id: String, sdp: String },

    /// A peer counterpart went away; the receiver may re-pull.
    #[serde(rename = "CLOSED")]
    Closed { connection_id: String },

    /// Tear down a local peer connection.
    #[serde(rename = "CLEAR")]
    Clear { connection_id: String },

    /// Classification probe directive.
    #[serde(rename = "CLASSIFYING")]
    Classifying { connection_id: String },
}
