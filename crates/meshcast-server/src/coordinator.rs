//! Event-driven overlay coordinator.
//!
//! Subscribes to client lifecycle, media, and peer events and reshapes the
//! overlay: it creates connections on PUSH/PULL, re-parents fetchers onto
//! peer forwarders when one is available, and unwinds everything a departing
//! client touched. Each event runs on its own task; handlers tolerate
//! "not found" everywhere because teardown races are expected.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use meshcast_core::broker::{Broker, BrokerError, Detail, Topic};
use meshcast_core::config::CoordinatorConfig;
use meshcast_core::db::{
    ConnectionInfo, ConnectionKind, ConnectionStatus, DatabaseError, SignalDatabase,
};
use meshcast_core::message::{
    Clear, Close, Connected, Deactivate, Downstream, Failed, Message, Push, Upstream,
};
use meshcast_core::wire::ServerFrame;

use crate::metrics::Metrics;
use crate::pool::ForwarderPool;
use crate::task::spawn_handler;

#[derive(Debug, thiserror::Error)]
enum CoordinatorError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct Coordinator {
    config: CoordinatorConfig,
    broker: Arc<Broker>,
    metrics: Arc<Metrics>,
    db: SignalDatabase,
    pool: Arc<ForwarderPool>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        broker: Arc<Broker>,
        metrics: Arc<Metrics>,
        db: SignalDatabase,
        pool: Arc<ForwarderPool>,
    ) -> Self {
        Self {
            config,
            broker,
            metrics,
            db,
            pool,
        }
    }

    /// Dispatch events until every subscription closes.
    pub async fn run(self: Arc<Self>) {
        let mut activate = self.broker.subscribe(Topic::Client, Detail::Activate).await;
        let mut deactivate = self.broker.subscribe(Topic::Client, Detail::Deactivate).await;
        let mut push = self.broker.subscribe(Topic::Client, Detail::Push).await;
        let mut pull = self.broker.subscribe(Topic::Client, Detail::Pull).await;
        let mut media_connected = self.broker.subscribe(Topic::Media, Detail::Connected).await;
        let mut media_disconnected = self
            .broker
            .subscribe(Topic::Media, Detail::Disconnected)
            .await;
        let mut peer_connected = self.broker.subscribe(Topic::Peer, Detail::Connected).await;
        let mut peer_disconnected = self
            .broker
            .subscribe(Topic::Peer, Detail::Disconnected)
            .await;
        let mut peer_failed = self.broker.subscribe(Topic::Peer, Detail::Failed).await;

        loop {
            tokio::select! {
                Some(msg) = activate.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("activate", async move { this.handle_activate(msg).await });
                }
                Some(msg) = deactivate.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("deactivate", async move { this.handle_deactivate(msg).await });
                }
                Some(msg) = push.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("push", async move { this.handle_push(msg).await });
                }
                Some(msg) = pull.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("pull", async move { this.handle_pull(msg).await });
                }
                Some(msg) = media_connected.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("media_connected", async move {
                        this.handle_media_connected(msg).await;
                    });
                }
                Some(msg) = media_disconnected.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("media_disconnected", async move {
                        this.handle_media_disconnected(msg).await;
                    });
                }
                Some(msg) = peer_connected.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("peer_connected", async move {
                        this.handle_peer_connected(msg).await;
                    });
                }
                Some(msg) = peer_disconnected.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("peer_disconnected", async move {
                        this.handle_peer_disconnected(msg).await;
                    });
                }
                Some(msg) = peer_failed.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("peer_failed", async move {
                        this.handle_peer_failed(msg).await;
                    });
                }
                else => break,
            }
        }
    }

    /// A client authenticated; record it. Re-activation of a known client is
    /// a no-op.
    async fn handle_activate(&self, msg: Message) {
        let Message::Activate(msg) = msg else {
            warn!("Unexpected message on Client/ACTIVATE");
            return;
        };

        match self.db.create_client(&msg.channel_id, &msg.client_id).await {
            Ok(_) => {
                info!(channel_id = %msg.channel_id, client_id = %msg.client_id, "Client activated");
            }
            Err(DatabaseError::ClientAlreadyExists(_)) => {
                debug!(client_id = %msg.client_id, "Client already active");
            }
            Err(e) => warn!(client_id = %msg.client_id, error = %e, "Failed to create client"),
        }
    }

    /// A client socket went away; the socket is the single source of truth
    /// for liveness, so unwind everything the client touched.
    async fn handle_deactivate(&self, msg: Message) {
        let Message::Deactivate(msg) = msg else {
            warn!("Unexpected message on Client/DEACTIVATE");
            return;
        };
        let Deactivate {
            channel_id,
            client_id,
        } = msg;

        // The client may have been forwarding: tell each of its fetchers the
        // branch is gone so they can pull again.
        match self.db.find_all_peer_by_from(&channel_id, &client_id).await {
            Ok(forwards) => {
                for forward in forwards {
                    if forward.is_connected() {
                        self.metrics.dec_peer_connections();
                    }
                    let frame = ServerFrame::Closed {
                        connection_id: forward.id.clone(),
                    };
                    if let Err(e) = self
                        .broker
                        .publish(
                            Topic::ClientSocket,
                            Detail::socket(&forward.channel_id, &forward.to_id),
                            Message::Frame(frame),
                        )
                        .await
                    {
                        warn!(connection_id = %forward.id, error = %e, "Failed to notify fetcher");
                    }
                    self.delete_connection_quietly(&forward.id).await;
                }
            }
            Err(e) => warn!(client_id = %client_id, error = %e, "Failed to list forwards"),
        }

        // Everything terminating at the client: its own server download plus
        // any peer links where it was the fetcher.
        match self.db.find_all_by_to(&channel_id, &client_id).await {
            Ok(connections) => {
                for conn in connections {
                    match conn.kind {
                        ConnectionKind::PushToServer | ConnectionKind::PullFromServer => {
                            let msg = Message::Clear(Clear {
                                connection_id: conn.id.clone(),
                            });
                            if let Err(e) =
                                self.broker.publish(Topic::Media, Detail::Clear, msg).await
                            {
                                warn!(connection_id = %conn.id, error = %e, "Failed to clear media");
                            }
                        }
                        ConnectionKind::PeerToPeer => {
                            let frame = ServerFrame::Clear {
                                connection_id: conn.id.clone(),
                            };
                            if let Err(e) = self
                                .broker
                                .publish(
                                    Topic::ClientSocket,
                                    Detail::socket(&conn.channel_id, &conn.from_id),
                                    Message::Frame(frame),
                                )
                                .await
                            {
                                warn!(connection_id = %conn.id, error = %e, "Failed to notify forwarder");
                            }
                            if conn.is_connected() {
                                self.metrics.dec_peer_connections();
                            }
                        }
                        // Stale probe; nothing to notify.
                        ConnectionKind::Classify => {}
                    }
                    self.delete_connection_quietly(&conn.id).await;

                    if conn.is_peer() {
                        // The forwarder freed a slot; its score must reflect
                        // that or it stays evicted as saturated.
                        if let Err(e) = self
                            .pool
                            .update_client_score(
                                &conn.from_id,
                                &conn.channel_id,
                                self.config.max_forwarding_number,
                            )
                            .await
                        {
                            if !matches!(&e, DatabaseError::ClientNotFound(_)) {
                                warn!(client_id = %conn.from_id, error = %e, "Failed to update score");
                            }
                        }
                    }
                }
            }
            Err(e) => warn!(client_id = %client_id, error = %e, "Failed to list connections"),
        }

        self.pool.remove_client(&client_id, &channel_id).await;

        if let Err(e) = self.db.delete_client(&channel_id, &client_id).await {
            if !e.is_not_found() {
                warn!(client_id = %client_id, error = %e, "Failed to delete client");
            }
        }

        // Publisher departure cascades: close the upstream, unwind every
        // remaining connection of the channel, and drop the channel itself.
        match self.db.find_upstream(&channel_id).await {
            Ok(upstream) if upstream.from_id == client_id => {
                let msg = Message::Close(Close {
                    connection_id: upstream.id.clone(),
                });
                if let Err(e) = self.broker.publish(Topic::Media, Detail::Close, msg).await {
                    warn!(connection_id = %upstream.id, error = %e, "Failed to close upstream");
                }
                self.delete_connection_quietly(&upstream.id).await;
                self.cascade_channel(&channel_id).await;
                if let Err(e) = self.db.delete_channel(&channel_id).await {
                    if !e.is_not_found() {
                        warn!(channel_id = %channel_id, error = %e, "Failed to delete channel");
                    }
                }
                info!(channel_id = %channel_id, "Publisher left, channel removed");
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(channel_id = %channel_id, error = %e, "Failed to find upstream"),
        }

        info!(channel_id = %channel_id, client_id = %client_id, "Client deactivated");
    }

    /// Unwind every connection still registered for a channel whose
    /// publisher left: media-side links are cleared, fetchers behind peer
    /// links are told to close.
    async fn cascade_channel(&self, channel_id: &str) {
        let remaining = match self.db.find_all_by_channel(channel_id).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Failed to list channel connections");
                return;
            }
        };

        for conn in remaining {
            match conn.kind {
                ConnectionKind::PushToServer | ConnectionKind::PullFromServer => {
                    let msg = Message::Clear(Clear {
                        connection_id: conn.id.clone(),
                    });
                    if let Err(e) = self.broker.publish(Topic::Media, Detail::Clear, msg).await {
                        warn!(connection_id = %conn.id, error = %e, "Failed to clear media");
                    }
                }
                ConnectionKind::PeerToPeer => {
                    let frame = ServerFrame::Closed {
                        connection_id: conn.id.clone(),
                    };
                    if let Err(e) = self
                        .broker
                        .publish(
                            Topic::ClientSocket,
                            Detail::socket(&conn.channel_id, &conn.to_id),
                            Message::Frame(frame),
                        )
                        .await
                    {
                        warn!(connection_id = %conn.id, error = %e, "Failed to notify fetcher");
                    }
                    if conn.is_connected() {
                        self.metrics.dec_peer_connections();
                    }
                }
                ConnectionKind::Classify => {}
            }
            self.delete_connection_quietly(&conn.id).await;
        }
    }

    /// A client wants to publish. At most one push per channel; a losing
    /// concurrent push is dropped silently.
    async fn handle_push(&self, msg: Message) {
        let Message::Push(msg) = msg else {
            warn!("Unexpected message on Client/PUSH");
            return;
        };
        let Push {
            connection_id,
            channel_id,
            client_id,
            sdp,
        } = msg;

        let conn = match self
            .db
            .create_push_connection(&channel_id, &client_id, &connection_id)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!(channel_id = %channel_id, client_id = %client_id, error = %e, "Push rejected");
                return;
            }
        };

        let msg = Message::Upstream(Upstream {
            connection_id: conn.id.clone(),
            key: format!("{}{}", conn.channel_id, conn.from_id),
            sdp,
        });
        if let Err(e) = self.broker.publish(Topic::Media, Detail::Upstream, msg).await {
            warn!(connection_id = %conn.id, error = %e, "Failed to publish upstream command");
        }
    }

    /// A client wants the stream; start with a server download.
    async fn handle_pull(&self, msg: Message) {
        let Message::Pull(msg) = msg else {
            warn!("Unexpected message on Client/PULL");
            return;
        };

        let conn = match self
            .db
            .create_pull_connection(&msg.channel_id, &msg.client_id, &msg.connection_id)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!(client_id = %msg.client_id, error = %e, "Pull rejected");
                return;
            }
        };

        let upstream = match self.db.find_upstream(&msg.channel_id).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(channel_id = %msg.channel_id, error = %e, "No upstream for pull");
                return;
            }
        };

        let command = Message::Downstream(Downstream {
            connection_id: conn.id.clone(),
            stream_id: upstream.id,
            key: format!("{}{}", conn.channel_id, conn.to_id),
            sdp: msg.sdp,
        });
        if let Err(e) = self
            .broker
            .publish(Topic::Media, Detail::Downstream, command)
            .await
        {
            warn!(connection_id = %conn.id, error = %e, "Failed to publish downstream command");
        }
    }

    /// A media connection came up. Viewers become balancing candidates.
    async fn handle_media_connected(&self, msg: Message) {
        let Message::Connected(msg) = msg else {
            warn!("Unexpected message on Media/CONNECTED");
            return;
        };

        let conn = match self.mark_connected(&msg).await {
            Some(conn) => conn,
            None => return,
        };

        if conn.is_upstream() {
            return;
        }

        if let Err(e) = self.balance(&conn.channel_id, &conn.to_id).await {
            warn!(
                channel_id = %conn.channel_id,
                client_id = %conn.to_id,
                error = %e,
                "Balancing failed, viewer stays on the media server"
            );
        }
    }

    /// Informational only; DEACTIVATE is authoritative for teardown.
    async fn handle_media_disconnected(&self, msg: Message) {
        if let Message::Disconnected(msg) = msg {
            debug!(connection_id = %msg.connection_id, "Media connection reported disconnected");
        }
    }

    /// A peer link came up: drop the fetcher's server download and tell the
    /// media server to clear the obsolete fan-out branch.
    async fn handle_peer_connected(&self, msg: Message) {
        let Message::Connected(msg) = msg else {
            warn!("Unexpected message on Peer/CONNECTED");
            return;
        };

        let peer_conn = match self.mark_connected(&msg).await {
            Some(conn) => conn,
            None => return,
        };

        let server_conn = match self
            .db
            .find_downstream(&peer_conn.channel_id, &peer_conn.to_id)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                debug!(client_id = %peer_conn.to_id, error = %e, "No server download to replace");
                return;
            }
        };

        self.delete_connection_quietly(&server_conn.id).await;
        self.metrics.inc_peer_connections();

        let msg = Message::Clear(Clear {
            connection_id: server_conn.id.clone(),
        });
        if let Err(e) = self.broker.publish(Topic::Media, Detail::Clear, msg).await {
            warn!(connection_id = %server_conn.id, error = %e, "Failed to clear replaced download");
        }
    }

    /// A peer link went away; forget it.
    async fn handle_peer_disconnected(&self, msg: Message) {
        let Message::Disconnected(msg) = msg else {
            warn!("Unexpected message on Peer/DISCONNECTED");
            return;
        };
        self.delete_connection_quietly(&msg.connection_id).await;
    }

    /// A peer link failed to establish; try to re-parent both endpoints
    /// independently.
    async fn handle_peer_failed(&self, msg: Message) {
        let Message::Failed(msg) = msg else {
            warn!("Unexpected message on Peer/FAILED");
            return;
        };
        let Failed { connection_id } = msg;

        let conn = match self.db.find_connection(&connection_id).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Failed connection already gone");
                return;
            }
        };

        if let Err(e) = self.balance(&conn.channel_id, &conn.to_id).await {
            warn!(client_id = %conn.to_id, error = %e, "Re-balancing fetcher failed");
        }
        if let Err(e) = self.balance(&conn.channel_id, &conn.from_id).await {
            warn!(client_id = %conn.from_id, error = %e, "Re-balancing forwarder failed");
        }
    }

    /// Decide whether `fetcher_id` should fetch from a peer instead of the
    /// media server. Without a viable forwarder the fetcher itself becomes a
    /// future candidate.
    async fn balance(&self, channel_id: &str, fetcher_id: &str) -> Result<(), CoordinatorError> {
        if !self.config.set_peer_connection {
            return Ok(());
        }

        let fetcher = self.db.find_client(channel_id, fetcher_id).await?;

        let forwarder = match self.pool.top_forwarder(channel_id).await {
            None => {
                self.pool.add_client(fetcher).await?;
                debug!(channel_id = %channel_id, client_id = %fetcher_id, "No forwarder, pooled fetcher");
                return Ok(());
            }
            // The only candidate is the fetcher itself; nothing to re-parent.
            Some(forwarder) if forwarder.id == fetcher.id => return Ok(()),
            Some(forwarder) => forwarder,
        };

        let peer_conn = self
            .db
            .create_peer_connection(
                channel_id,
                &forwarder.id,
                &fetcher.id,
                &Uuid::new_v4().to_string(),
            )
            .await?;

        self.metrics.inc_balancing_occurs();
        self.pool
            .update_client_score(&forwarder.id, channel_id, self.config.max_forwarding_number)
            .await?;

        let frame = ServerFrame::Forward {
            connection_id: peer_conn.id.clone(),
        };
        self.broker
            .publish(
                Topic::ClientSocket,
                Detail::socket(channel_id, &fetcher.id),
                Message::Frame(frame),
            )
            .await?;

        info!(
            channel_id = %channel_id,
            forwarder = %forwarder.id,
            fetcher = %fetcher.id,
            connection_id = %peer_conn.id,
            "Fetcher re-parented onto forwarder"
        );
        Ok(())
    }

    /// Mark a connection Connected, tolerating duplicates: the same
    /// CONNECTED event delivered twice must not trigger a second balance.
    async fn mark_connected(&self, msg: &Connected) -> Option<ConnectionInfo> {
        let existing = match self.db.find_connection(&msg.connection_id).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(connection_id = %msg.connection_id, error = %e, "Connection already gone");
                return None;
            }
        };
        if existing.is_connected() {
            debug!(connection_id = %msg.connection_id, "Duplicate CONNECTED ignored");
            return None;
        }

        match self
            .db
            .update_connection_status(&msg.connection_id, ConnectionStatus::Connected)
            .await
        {
            Ok(conn) => Some(conn),
            Err(e) => {
                debug!(connection_id = %msg.connection_id, error = %e, "Failed to mark connected");
                None
            }
        }
    }

    async fn delete_connection_quietly(&self, connection_id: &str) {
        if let Err(e) = self.db.delete_connection(connection_id).await {
            if !e.is_not_found() {
                warn!(connection_id = %connection_id, error = %e, "Failed to delete connection");
            }
        }
    }
}
