//! Forwarder classification pipeline.
//!
//! Candidates are probed by pairing them with fetchers: the server creates a
//! classify connection and directs the fetcher to test-fetch from the
//! candidate. Probes run on a periodic sweep and in reaction to connection
//! events; outcomes promote the candidate to Forwarder or demote it to
//! Fetcher.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use meshcast_core::broker::{Broker, BrokerError, Detail, Topic};
use meshcast_core::config::ClassifierConfig;
use meshcast_core::db::{ClientClass, ClientInfo, DatabaseError, SignalDatabase};
use meshcast_core::message::Message;
use meshcast_core::wire::ServerFrame;

use crate::task::spawn_handler;

#[derive(Debug, thiserror::Error)]
enum ClassifierError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct Classifier {
    config: ClassifierConfig,
    broker: Arc<Broker>,
    db: SignalDatabase,
}

impl Classifier {
    pub fn new(config: ClassifierConfig, broker: Arc<Broker>, db: SignalDatabase) -> Self {
        Self { config, broker, db }
    }

    /// Dispatch classification events and drive the periodic sweep.
    pub async fn run(self: Arc<Self>) {
        let mut media_connected = self.broker.subscribe(Topic::Media, Detail::Connected).await;
        let mut peer_connected = self.broker.subscribe(Topic::Peer, Detail::Connected).await;
        let mut peer_failed = self.broker.subscribe(Topic::Peer, Detail::Failed).await;
        let mut classified = self
            .broker
            .subscribe(Topic::Classification, Detail::Classified)
            .await;

        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            let period = Duration::from_secs(sweeper.config.interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; the sweep should wait a
            // full period.
            interval.tick().await;
            loop {
                interval.tick().await;
                debug!("Running periodic classification sweep");
                sweeper.sweep().await;
            }
        });

        loop {
            tokio::select! {
                Some(msg) = media_connected.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("classifier_media_connected", async move {
                        this.handle_media_connected(msg).await;
                    });
                }
                Some(msg) = peer_connected.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("classifier_peer_connected", async move {
                        this.handle_peer_connected(msg).await;
                    });
                }
                Some(msg) = peer_failed.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("classifier_peer_failed", async move {
                        this.handle_peer_failed(msg).await;
                    });
                }
                Some(msg) = classified.recv() => {
                    let this = Arc::clone(&self);
                    spawn_handler("classifier_outcome", async move {
                        this.handle_classified(msg).await;
                    });
                }
                else => break,
            }
        }
    }

    /// Pair every candidate with a fetcher, round-robin across fetchers.
    async fn sweep(&self) {
        let channels = match self.db.find_all_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "Sweep failed to list channels");
                return;
            }
        };

        for channel in channels {
            let candidates = match self
                .db
                .find_clients_by_class(&channel.id, ClientClass::Candidate)
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(channel_id = %channel.id, error = %e, "Failed to list candidates");
                    continue;
                }
            };
            let fetchers = match self
                .db
                .find_clients_by_class(&channel.id, ClientClass::Fetcher)
                .await
            {
                Ok(fetchers) => fetchers,
                Err(e) => {
                    warn!(channel_id = %channel.id, error = %e, "Failed to list fetchers");
                    continue;
                }
            };

            if candidates.is_empty() || fetchers.is_empty() {
                debug!(channel_id = %channel.id, "Nothing to classify");
                continue;
            }

            for (i, candidate) in candidates.iter().enumerate() {
                let fetcher = &fetchers[i % fetchers.len()];
                if let Err(e) = self.classify(candidate, fetcher).await {
                    warn!(
                        candidate = %candidate.id,
                        fetcher = %fetcher.id,
                        error = %e,
                        "Probe failed"
                    );
                }
            }
        }
    }

    /// A viewer connected to the media server; probe its forwarding
    /// capability with one existing fetcher.
    async fn handle_media_connected(&self, msg: Message) {
        let Message::Connected(msg) = msg else {
            warn!("Unexpected message on Media/CONNECTED");
            return;
        };

        let conn = match self.db.find_connection(&msg.connection_id).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(connection_id = %msg.connection_id, error = %e, "Connection gone");
                return;
            }
        };
        if conn.is_upstream() {
            return;
        }

        let client = match self.db.find_client(&conn.channel_id, &conn.to_id).await {
            Ok(client) => client,
            Err(e) => {
                debug!(client_id = %conn.to_id, error = %e, "Client gone");
                return;
            }
        };

        let fetchers = match self
            .db
            .find_clients_by_class(&conn.channel_id, ClientClass::Fetcher)
            .await
        {
            Ok(fetchers) => fetchers,
            Err(e) => {
                warn!(channel_id = %conn.channel_id, error = %e, "Failed to list fetchers");
                return;
            }
        };
        let Some(fetcher) = fetchers.iter().find(|f| f.id != client.id) else {
            debug!(channel_id = %conn.channel_id, "No fetcher available for probing");
            return;
        };

        if let Err(e) = self.classify(&client, fetcher).await {
            warn!(candidate = %client.id, error = %e, "Probe failed");
        }
    }

    /// Both ends of an established peer link are proven; make them
    /// candidates again.
    async fn handle_peer_connected(&self, msg: Message) {
        let Message::Connected(msg) = msg else {
            warn!("Unexpected message on Peer/CONNECTED");
            return;
        };

        let conn = match self.db.find_connection(&msg.connection_id).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(connection_id = %msg.connection_id, error = %e, "Connection gone");
                return;
            }
        };

        for client_id in [&conn.from_id, &conn.to_id] {
            if let Err(e) = self
                .db
                .update_client_class(&conn.channel_id, client_id, ClientClass::Candidate)
                .await
            {
                if !e.is_not_found() {
                    warn!(client_id = %client_id, error = %e, "Failed to promote");
                }
            }
        }
    }

    /// A peer link failed: demote both ends to fetchers and re-probe with
    /// the remaining candidates.
    async fn handle_peer_failed(&self, msg: Message) {
        let Message::Failed(msg) = msg else {
            warn!("Unexpected message on Peer/FAILED");
            return;
        };

        let conn = match self.db.find_connection(&msg.connection_id).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(connection_id = %msg.connection_id, error = %e, "Connection gone");
                return;
            }
        };

        for client_id in [&conn.from_id, &conn.to_id] {
            if let Err(e) = self
                .db
                .update_client_class(&conn.channel_id, client_id, ClientClass::Fetcher)
                .await
            {
                if !e.is_not_found() {
                    warn!(client_id = %client_id, error = %e, "Failed to demote");
                }
            }
        }

        let candidates = match self
            .db
            .find_clients_by_class(&conn.channel_id, ClientClass::Candidate)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(channel_id = %conn.channel_id, error = %e, "Failed to list candidates");
                return;
            }
        };
        if candidates.is_empty() {
            debug!(channel_id = %conn.channel_id, "No candidates left to probe");
            return;
        }

        for (candidate, demoted_id) in candidates.iter().zip([&conn.from_id, &conn.to_id]) {
            let fetcher = match self.db.find_client(&conn.channel_id, demoted_id).await {
                Ok(fetcher) => fetcher,
                Err(e) => {
                    debug!(client_id = %demoted_id, error = %e, "Demoted client gone");
                    continue;
                }
            };
            if let Err(e) = self.classify(candidate, &fetcher).await {
                warn!(candidate = %candidate.id, error = %e, "Probe failed");
            }
        }
    }

    /// Probe outcome: promote the candidate on success, demote on failure,
    /// and retire the probe connection.
    async fn handle_classified(&self, msg: Message) {
        let Message::Classified(msg) = msg else {
            warn!("Unexpected message on Classification/CLASSIFIED");
            return;
        };

        let conn = match self.db.find_connection(&msg.connection_id).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(connection_id = %msg.connection_id, error = %e, "Probe connection gone");
                return;
            }
        };

        let class = if msg.success {
            ClientClass::Forwarder
        } else {
            ClientClass::Fetcher
        };
        match self
            .db
            .update_client_class(&conn.channel_id, &conn.from_id, class)
            .await
        {
            Ok(()) => {
                info!(client_id = %conn.from_id, ?class, "Client reclassified");
            }
            Err(e) if e.is_not_found() => {
                debug!(client_id = %conn.from_id, "Probed client already gone");
            }
            Err(e) => warn!(client_id = %conn.from_id, error = %e, "Failed to reclassify"),
        }

        if let Err(e) = self.db.delete_connection(&conn.id).await {
            if !e.is_not_found() {
                warn!(connection_id = %conn.id, error = %e, "Failed to retire probe");
            }
        }
    }

    /// Create a probe connection and direct the fetcher to test the
    /// candidate.
    async fn classify(
        &self,
        candidate: &ClientInfo,
        fetcher: &ClientInfo,
    ) -> Result<(), ClassifierError> {
        let conn = self
            .db
            .create_classify_connection(
                &fetcher.channel_id,
                &candidate.id,
                &fetcher.id,
                &Uuid::new_v4().to_string(),
            )
            .await?;

        self.broker
            .publish(
                Topic::ClientSocket,
                Detail::socket(&fetcher.channel_id, &fetcher.id),
                Message::Frame(ServerFrame::Classifying {
                    connection_id: conn.id.clone(),
                }),
            )
            .await?;

        debug!(
            candidate = %candidate.id,
            fetcher = %fetcher.id,
            connection_id = %conn.id,
            "Probe dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcast_core::message::{Classified, Connected, Failed};

    struct Harness {
        classifier: Arc<Classifier>,
        broker: Arc<Broker>,
        db: SignalDatabase,
    }

    async fn harness() -> Harness {
        let broker = Arc::new(Broker::new());
        let db = SignalDatabase::open_in_memory().await.unwrap();
        db.ensure_default_channel("C1", "K1").await.unwrap();
        let classifier = Arc::new(Classifier::new(
            ClassifierConfig { interval_secs: 60 },
            Arc::clone(&broker),
            db.clone(),
        ));
        Harness {
            classifier,
            broker,
            db,
        }
    }

    #[tokio::test]
    async fn sweep_pairs_candidates_with_fetchers() {
        let h = harness().await;
        h.db.create_client("C1", "X").await.unwrap();
        h.db.create_client("C1", "Y").await.unwrap();
        h.db.update_client_class("C1", "Y", ClientClass::Fetcher)
            .await
            .unwrap();
        let mut y_socket = h
            .broker
            .subscribe(Topic::ClientSocket, Detail::socket("C1", "Y"))
            .await;

        h.classifier.sweep().await;

        let Message::Frame(ServerFrame::Classifying { connection_id }) =
            y_socket.recv().await.unwrap()
        else {
            panic!("expected CLASSIFYING directive");
        };
        let probe = h.db.find_connection(&connection_id).await.unwrap();
        assert_eq!(probe.from_id, "X");
        assert_eq!(probe.to_id, "Y");
    }

    #[tokio::test]
    async fn sweep_without_fetchers_does_nothing() {
        let h = harness().await;
        h.db.create_client("C1", "X").await.unwrap();

        h.classifier.sweep().await;

        assert!(h.db.find_all_by_channel("C1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_probe_promotes_candidate_to_forwarder() {
        let h = harness().await;
        h.db.create_client("C1", "X").await.unwrap();
        h.db.create_client("C1", "Y").await.unwrap();
        h.db.create_classify_connection("C1", "X", "Y", "c-cl")
            .await
            .unwrap();

        h.classifier
            .handle_classified(Message::Classified(Classified {
                connection_id: "c-cl".into(),
                channel_id: "C1".into(),
                success: true,
            }))
            .await;

        let x = h.db.find_client("C1", "X").await.unwrap();
        assert_eq!(x.class, ClientClass::Forwarder);
        // The probe connection is retired.
        assert!(h.db.find_connection("c-cl").await.is_err());
    }

    #[tokio::test]
    async fn failed_probe_demotes_candidate_to_fetcher() {
        let h = harness().await;
        h.db.create_client("C1", "X").await.unwrap();
        h.db.create_client("C1", "Y").await.unwrap();
        h.db.create_classify_connection("C1", "X", "Y", "c-cl")
            .await
            .unwrap();

        h.classifier
            .handle_classified(Message::Classified(Classified {
                connection_id: "c-cl".into(),
                channel_id: "C1".into(),
                success: false,
            }))
            .await;

        let x = h.db.find_client("C1", "X").await.unwrap();
        assert_eq!(x.class, ClientClass::Fetcher);
    }

    #[tokio::test]
    async fn peer_connected_promotes_both_endpoints() {
        let h = harness().await;
        h.db.create_client("C1", "V").await.unwrap();
        h.db.create_client("C1", "W").await.unwrap();
        h.db.update_client_class("C1", "V", ClientClass::Fetcher)
            .await
            .unwrap();
        h.db.update_client_class("C1", "W", ClientClass::Fetcher)
            .await
            .unwrap();
        h.db.create_peer_connection("C1", "V", "W", "c-p1").await.unwrap();

        h.classifier
            .handle_peer_connected(Message::Connected(Connected {
                connection_id: "c-p1".into(),
            }))
            .await;

        assert_eq!(
            h.db.find_client("C1", "V").await.unwrap().class,
            ClientClass::Candidate
        );
        assert_eq!(
            h.db.find_client("C1", "W").await.unwrap().class,
            ClientClass::Candidate
        );
    }

    #[tokio::test]
    async fn peer_failed_demotes_and_reprobes() {
        let h = harness().await;
        h.db.create_client("C1", "V").await.unwrap();
        h.db.create_client("C1", "W").await.unwrap();
        h.db.create_client("C1", "X").await.unwrap();
        h.db.create_peer_connection("C1", "V", "W", "c-p1").await.unwrap();
        let mut v_socket = h
            .broker
            .subscribe(Topic::ClientSocket, Detail::socket("C1", "V"))
            .await;

        h.classifier
            .handle_peer_failed(Message::Failed(Failed {
                connection_id: "c-p1".into(),
            }))
            .await;

        assert_eq!(
            h.db.find_client("C1", "V").await.unwrap().class,
            ClientClass::Fetcher
        );
        assert_eq!(
            h.db.find_client("C1", "W").await.unwrap().class,
            ClientClass::Fetcher
        );

        // The remaining candidate X is probed against demoted V.
        let Message::Frame(ServerFrame::Classifying { connection_id }) =
            v_socket.recv().await.unwrap()
        else {
            panic!("expected CLASSIFYING directive");
        };
        let probe = h.db.find_connection(&connection_id).await.unwrap();
        assert_eq!(probe.from_id, "X");
        assert_eq!(probe.to_id, "V");
    }

    #[tokio::test]
    async fn media_connected_probes_new_viewer() {
        let h = harness().await;
        h.db.create_client("C1", "V").await.unwrap();
        h.db.create_client("C1", "Y").await.unwrap();
        h.db.update_client_class("C1", "Y", ClientClass::Fetcher)
            .await
            .unwrap();
        h.db.create_pull_connection("C1", "V", "c-v1").await.unwrap();
        let mut y_socket = h
            .broker
            .subscribe(Topic::ClientSocket, Detail::socket("C1", "Y"))
            .await;

        h.classifier
            .handle_media_connected(Message::Connected(Connected {
                connection_id: "c-v1".into(),
            }))
            .await;

        let Message::Frame(ServerFrame::Classifying { connection_id }) =
            y_socket.recv().await.unwrap()
        else {
            panic!("expected CLASSIFYING directive");
        };
        let probe = h.db.find_connection(&connection_id).await.unwrap();
        assert_eq!(probe.from_id, "V");
    }

    #[tokio::test]
    async fn upstream_connected_is_not_probed() {
        let h = harness().await;
        h.db.create_client("C1", "P").await.unwrap();
        h.db.create_client("C1", "Y").await.unwrap();
        h.db.update_client_class("C1", "Y", ClientClass::Fetcher)
            .await
            .unwrap();
        h.db.create_push_connection("C1", "P", "c-pub").await.unwrap();

        h.classifier
            .handle_media_connected(Message::Connected(Connected {
                connection_id: "c-pub".into(),
            }))
            .await;

        // No probe connection was created.
        let all = h.db.find_all_by_channel("C1").await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
