//! Per-socket signaling session.
//!
//! Lifecycle: authenticate with a single ACTIVATE frame, then run two loops
//! until the socket dies -- fan-in reads requests and routes them into the
//! broker, fan-out forwards broker frames onto the socket. Teardown always
//! publishes `Client/DEACTIVATE`; the socket is the single source of truth
//! for client liveness.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meshcast_core::broker::{BrokerError, Detail, Subscription, Topic};
use meshcast_core::db::{ConnectionInfo, DatabaseError};
use meshcast_core::message::{
    Activate, Classified, Connected, Deactivate, Disconnected, Failed, Message, Pull, Push,
};
use meshcast_core::wire::{ClientRequest, ServerFrame};

use super::SignalState;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("socket closed before activation")]
    ClosedBeforeActivate,

    #[error("expected an ACTIVATE request first")]
    ExpectedActivate,

    #[error("invalid key for channel: {0}")]
    InvalidKey(String),

    #[error("client {client_id} is not authorized for connection {connection_id}")]
    Unauthorized {
        client_id: String,
        connection_id: String,
    },

    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Drive one socket from accept to teardown.
pub async fn run(mut socket: WebSocket, state: Arc<SignalState>) {
    state.metrics.inc_websocket_connections();
    state.metrics.inc_connection_attempts();

    let (channel_id, client_id) = match authenticate(&mut socket, &state).await {
        Ok(ids) => ids,
        Err(e) => {
            state.metrics.inc_connection_failures();
            state.metrics.dec_websocket_connections();
            warn!(error = %e, "Session rejected during activation");
            return;
        }
    };

    let activated = state
        .broker
        .publish(
            Topic::Client,
            Detail::Activate,
            Message::Activate(Activate {
                channel_id: channel_id.clone(),
                client_id: client_id.clone(),
            }),
        )
        .await;
    if let Err(e) = activated {
        state.metrics.inc_connection_failures();
        state.metrics.dec_websocket_connections();
        warn!(channel_id = %channel_id, client_id = %client_id, error = %e, "Activation not delivered");
        return;
    }

    state.metrics.inc_connection_successes();
    info!(channel_id = %channel_id, client_id = %client_id, "Session activated");

    let detail = Detail::socket(&channel_id, &client_id);
    let subscription = state
        .broker
        .subscribe(Topic::ClientSocket, detail.clone())
        .await;

    let cancel = CancellationToken::new();
    let (sender, mut receiver) = socket.split();
    let fan_out_task = tokio::spawn(fan_out(
        sender,
        subscription,
        detail,
        cancel.clone(),
        Arc::clone(&state),
        client_id.clone(),
    ));

    if let Err(e) = fan_in(&mut receiver, &state, &channel_id, &client_id).await {
        warn!(channel_id = %channel_id, client_id = %client_id, error = %e, "Session terminated");
    }

    // The socket may be long gone; the deactivation must go out regardless.
    let deactivated = state
        .broker
        .publish(
            Topic::Client,
            Detail::Deactivate,
            Message::Deactivate(Deactivate {
                channel_id: channel_id.clone(),
                client_id: client_id.clone(),
            }),
        )
        .await;
    if let Err(e) = deactivated {
        warn!(channel_id = %channel_id, client_id = %client_id, error = %e, "Deactivation not delivered");
    }

    cancel.cancel();
    let _ = fan_out_task.await;
    state.metrics.dec_websocket_connections();
    info!(channel_id = %channel_id, client_id = %client_id, "Session closed");
}

/// Read the single ACTIVATE frame, verify the channel key, and acknowledge.
async fn authenticate(
    socket: &mut WebSocket,
    state: &SignalState,
) -> Result<(String, String), SessionError> {
    let frame = loop {
        match socket.recv().await {
            None => return Err(SessionError::ClosedBeforeActivate),
            Some(result) => match result? {
                WsMessage::Text(text) => break text,
                WsMessage::Close(_) => return Err(SessionError::ClosedBeforeActivate),
                // Control frames may precede activation.
                _ => continue,
            },
        }
    };

    let request: ClientRequest = serde_json::from_str(frame.as_str())?;
    let ClientRequest::Activate {
        channel_id,
        channel_key,
        client_id,
    } = request
    else {
        return Err(SessionError::ExpectedActivate);
    };

    let channel = if state.config.auto_create_channels {
        state
            .db
            .find_or_create_channel(&channel_id, &channel_key)
            .await?
    } else {
        state.db.find_channel(&channel_id).await?
    };

    if !channel.authenticate(&channel_key) {
        return Err(SessionError::InvalidKey(channel_id));
    }

    let ack = ServerFrame::Activate {
        message: format!("channel {channel_id} activated"),
    };
    socket
        .send(WsMessage::Text(serde_json::to_string(&ack)?.into()))
        .await?;

    Ok((channel_id, client_id))
}

/// Forward broker frames for this client onto the socket until the session
/// is cancelled or the socket write fails.
async fn fan_out(
    mut sender: SplitSink<WebSocket, WsMessage>,
    mut subscription: Subscription,
    detail: Detail,
    cancel: CancellationToken,
    state: Arc<SignalState>,
    client_id: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = subscription.recv() => match msg {
                None => break,
                Some(Message::Frame(frame)) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(client_id = %client_id, error = %e, "Failed to encode frame");
                            continue;
                        }
                    };
                    if let Err(e) = sender.send(WsMessage::Text(text.into())).await {
                        debug!(client_id = %client_id, error = %e, "Socket write failed");
                        break;
                    }
                }
                Some(other) => {
                    warn!(client_id = %client_id, ?other, "Non-frame message on socket detail");
                }
            }
        }
    }

    if let Err(e) = state
        .broker
        .unsubscribe(Topic::ClientSocket, detail, &subscription)
        .await
    {
        warn!(client_id = %client_id, error = %e, "Unsubscribe failed");
    }
}

/// Read and dispatch requests until the socket closes. Malformed frames are
/// skipped; an authorization failure ends the session.
async fn fan_in(
    receiver: &mut SplitStream<WebSocket>,
    state: &SignalState,
    channel_id: &str,
    client_id: &str,
) -> Result<(), SessionError> {
    while let Some(result) = receiver.next().await {
        let msg = result?;
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let request = match serde_json::from_str::<ClientRequest>(text.as_str()) {
            Ok(request) => request,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Skipping malformed frame");
                continue;
            }
        };

        match handle_request(state, channel_id, client_id, request).await {
            Ok(()) => {}
            Err(e @ SessionError::Unauthorized { .. }) => return Err(e),
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Request failed");
            }
        }
    }
    Ok(())
}

async fn handle_request(
    state: &SignalState,
    channel_id: &str,
    client_id: &str,
    request: ClientRequest,
) -> Result<(), SessionError> {
    match request {
        ClientRequest::Activate { .. } => {
            warn!(client_id = %client_id, "Duplicate ACTIVATE ignored");
            Ok(())
        }

        ClientRequest::Push { connection_id, sdp } => {
            state
                .broker
                .publish(
                    Topic::Client,
                    Detail::Push,
                    Message::Push(Push {
                        connection_id,
                        channel_id: channel_id.to_string(),
                        client_id: client_id.to_string(),
                        sdp,
                    }),
                )
                .await?;
            Ok(())
        }

        ClientRequest::Pull { connection_id, sdp } => {
            state
                .broker
                .publish(
                    Topic::Client,
                    Detail::Pull,
                    Message::Pull(Pull {
                        connection_id,
                        channel_id: channel_id.to_string(),
                        client_id: client_id.to_string(),
                        sdp,
                    }),
                )
                .await?;
            Ok(())
        }

        ClientRequest::Forward { connection_id, sdp } => {
            let conn = authorized(state, channel_id, client_id, &connection_id).await?;
            let counterpart = conn.counterpart(client_id).to_string();
            state
                .broker
                .publish(
                    Topic::ClientSocket,
                    Detail::socket(channel_id, &counterpart),
                    Message::Frame(ServerFrame::Forwarding { connection_id, sdp }),
                )
                .await?;
            Ok(())
        }

        ClientRequest::Signal {
            connection_id,
            signal_type,
            signal_data,
        } => {
            let conn = authorized(state, channel_id, client_id, &connection_id).await?;
            let counterpart = conn.counterpart(client_id).to_string();
            state
                .broker
                .publish(
                    Topic::ClientSocket,
                    Detail::socket(channel_id, &counterpart),
                    Message::Frame(ServerFrame::Signal {
                        connection_id,
                        signal_type,
                        signal_data,
                    }),
                )
                .await?;
            Ok(())
        }

        ClientRequest::Connected { connection_id } => {
            authorized(state, channel_id, client_id, &connection_id).await?;
            state
                .broker
                .publish(
                    Topic::Peer,
                    Detail::Connected,
                    Message::Connected(Connected { connection_id }),
                )
                .await?;
            Ok(())
        }

        ClientRequest::Disconnected { connection_id } => {
            authorized(state, channel_id, client_id, &connection_id).await?;
            state
                .broker
                .publish(
                    Topic::Peer,
                    Detail::Disconnected,
                    Message::Disconnected(Disconnected { connection_id }),
                )
                .await?;
            Ok(())
        }

        ClientRequest::Failed { connection_id } => {
            authorized(state, channel_id, client_id, &connection_id).await?;
            state
                .broker
                .publish(
                    Topic::Peer,
                    Detail::Failed,
                    Message::Failed(Failed { connection_id }),
                )
                .await?;
            Ok(())
        }

        ClientRequest::Classified {
            connection_id,
            success,
        } => {
            authorized(state, channel_id, client_id, &connection_id).await?;
            state
                .broker
                .publish(
                    Topic::Classification,
                    Detail::Classified,
                    Message::Classified(Classified {
                        connection_id,
                        channel_id: channel_id.to_string(),
                        success,
                    }),
                )
                .await?;
            Ok(())
        }
    }
}

/// Look up the referenced connection and check the caller may act on it.
async fn authorized(
    state: &SignalState,
    channel_id: &str,
    client_id: &str,
    connection_id: &str,
) -> Result<ConnectionInfo, SessionError> {
    let conn = state.db.find_connection(connection_id).await?;
    if !conn.authorize(channel_id, client_id) {
        return Err(SessionError::Unauthorized {
            client_id: client_id.to_string(),
            connection_id: connection_id.to_string(),
        });
    }
    Ok(conn)
}
