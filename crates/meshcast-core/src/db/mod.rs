//! In-memory relational store of channels, clients, and connections.
//!
//! Backed by an in-memory SQLite database, which provides the transactional
//! semantics the coordinator relies on: writers serialize per transaction,
//! reads see a consistent snapshot, and every query returns owned copies of
//! the stored rows. A restart loses everything by design.

mod models;
mod queries_channels;
mod queries_clients;
mod queries_connections;
mod store;


pub use models::{
    ChannelInfo, ClientClass, ClientInfo, ConnectionInfo, ConnectionKind, ConnectionStatus,
    DEFAULT_CHANNEL_ID, DEFAULT_CHANNEL_KEY, MEDIA_SERVER_ID,
};
pub use store::{unix_timestamp, DatabaseError, SignalDatabase};
