//! Process wiring: builds every component and runs the listeners.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use meshcast_core::broker::Broker;
use meshcast_core::config::Config;
use meshcast_core::db::{SignalDatabase, DEFAULT_CHANNEL_ID, DEFAULT_CHANNEL_KEY};
use meshcast_media::Media;

use crate::classifier::Classifier;
use crate::coordinator::Coordinator;
use crate::metrics::Metrics;
use crate::pool::ForwarderPool;
use crate::signal::{self, SignalState};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Database(#[from] meshcast_core::db::DatabaseError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// The assembled server. [`Server::run`] consumes it and blocks until
/// shutdown.
pub struct Server {
    config: Config,
    broker: Arc<Broker>,
    db: SignalDatabase,
    metrics: Arc<Metrics>,
    media: Arc<Media>,
    coordinator: Arc<Coordinator>,
    classifier: Arc<Classifier>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let broker = Arc::new(Broker::new());

        let db = SignalDatabase::open_in_memory().await?;
        if config.database.set_default_channel {
            let channel = db
                .ensure_default_channel(DEFAULT_CHANNEL_ID, DEFAULT_CHANNEL_KEY)
                .await?;
            info!(channel_id = %channel.id, "Default channel created");
        }

        let metrics = Arc::new(Metrics::new()?);
        let pool = Arc::new(ForwarderPool::new(db.clone()));
        let media = Arc::new(Media::new(
            config.media.clone(),
            Arc::clone(&broker),
            metrics.webrtc_connections_gauge(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            config.coordinator.clone(),
            Arc::clone(&broker),
            Arc::clone(&metrics),
            db.clone(),
            Arc::clone(&pool),
        ));
        let classifier = Arc::new(Classifier::new(
            config.classifier.clone(),
            Arc::clone(&broker),
            db.clone(),
        ));

        Ok(Self {
            config,
            broker,
            db,
            metrics,
            media,
            coordinator,
            classifier,
        })
    }

    /// Start every component and serve until a shutdown signal arrives.
    pub async fn run(self) -> Result<(), ServerError> {
        tokio::spawn(Arc::clone(&self.media).run());
        tokio::spawn(Arc::clone(&self.coordinator).run());
        tokio::spawn(Arc::clone(&self.classifier).run());

        self.spawn_metrics_server().await?;

        let state = Arc::new(SignalState {
            broker: Arc::clone(&self.broker),
            db: self.db.clone(),
            metrics: Arc::clone(&self.metrics),
            config: self.config.signal.clone(),
        });
        let app = signal::router(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.signal.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(addr = %addr, "Signal server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped");
        Ok(())
    }

    async fn spawn_metrics_server(&self) -> Result<(), ServerError> {
        let metrics = Arc::clone(&self.metrics);
        let app = Router::new().route(
            &self.config.metrics.path,
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move { metrics.render() }
            }),
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.metrics.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(addr = %addr, path = %self.config.metrics.path, "Metrics server listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "Metrics server stopped");
            }
        });
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
