//! Live WebSocket session tests against the signaling router.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use meshcast_core::broker::{Broker, Detail, Topic};
use meshcast_core::config::{CoordinatorConfig, SignalConfig};
use meshcast_core::db::SignalDatabase;
use meshcast_server::coordinator::Coordinator;
use meshcast_server::metrics::Metrics;
use meshcast_server::pool::ForwarderPool;
use meshcast_server::signal::{self, SignalState};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    url: String,
    db: SignalDatabase,
    broker: Arc<Broker>,
}

async fn start_server() -> TestServer {
    let broker = Arc::new(Broker::new());
    let db = SignalDatabase::open_in_memory().await.unwrap();
    db.ensure_default_channel("C1", "K1").await.unwrap();
    let metrics = Arc::new(Metrics::new().unwrap());

    // The coordinator keeps the Client/* topics alive and reacts to
    // lifecycle events, as in the full process.
    let pool = Arc::new(ForwarderPool::new(db.clone()));
    let coordinator = Arc::new(Coordinator::new(
        CoordinatorConfig::default(),
        Arc::clone(&broker),
        Arc::clone(&metrics),
        db.clone(),
        Arc::clone(&pool),
    ));
    tokio::spawn(coordinator.run());

    let state = Arc::new(SignalState {
        broker: Arc::clone(&broker),
        db: db.clone(),
        metrics,
        config: SignalConfig {
            port: 0,
            auto_create_channels: false,
        },
    });
    let app = signal::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        url: format!("ws://{addr}/ws"),
        db,
        broker,
    }
}

async fn connect(server: &TestServer) -> ClientSocket {
    let (socket, _) = connect_async(server.url.as_str()).await.unwrap();
    socket
}

async fn send_json(socket: &mut ClientSocket, json: &str) {
    socket
        .send(WsMessage::Text(json.to_string().into()))
        .await
        .unwrap();
}

async fn recv_json(socket: &mut ClientSocket) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Wait until the server closes the connection.
async fn assert_closed(socket: &mut ClientSocket) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
            Err(_) => panic!("socket was not closed"),
            Ok(None) => return,
            Ok(Some(Err(_))) => return,
            Ok(Some(Ok(WsMessage::Close(_)))) => return,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

async fn activate(socket: &mut ClientSocket, channel: &str, key: &str, client: &str) {
    let request = format!(
        r#"{{"type":"ACTIVATE","payload":{{"channel_id":"{channel}","channel_key":"{key}","client_id":"{client}"}}}}"#
    );
    send_json(socket, &request).await;
    let response = recv_json(socket).await;
    assert_eq!(response["type"], "ACTIVATE");
}

#[tokio::test]
async fn activate_with_valid_key_is_acknowledged() {
    let server = start_server().await;
    let mut socket = connect(&server).await;

    activate(&mut socket, "C1", "K1", "P").await;

    // The coordinator recorded the client.
    for _ in 0..100 {
        if server.db.find_client("C1", "P").await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client was never activated");
}

#[tokio::test]
async fn activate_with_wrong_key_closes_the_socket() {
    let server = start_server().await;
    let mut socket = connect(&server).await;

    send_json(
        &mut socket,
        r#"{"type":"ACTIVATE","payload":{"channel_id":"C1","channel_key":"wrong","client_id":"P"}}"#,
    )
    .await;

    assert_closed(&mut socket).await;
    assert!(server.db.find_client("C1", "P").await.is_err());
}

#[tokio::test]
async fn activate_with_unknown_channel_closes_the_socket() {
    let server = start_server().await;
    let mut socket = connect(&server).await;

    send_json(
        &mut socket,
        r#"{"type":"ACTIVATE","payload":{"channel_id":"nope","channel_key":"K1","client_id":"P"}}"#,
    )
    .await;

    assert_closed(&mut socket).await;
}

#[tokio::test]
async fn first_frame_must_be_activate() {
    let server = start_server().await;
    let mut socket = connect(&server).await;

    send_json(
        &mut socket,
        r#"{"type":"PULL","payload":{"connection_id":"c-1","sdp":"x"}}"#,
    )
    .await;

    assert_closed(&mut socket).await;
}

#[tokio::test]
async fn signal_is_relayed_to_the_counterpart() {
    let server = start_server().await;
    let mut forwarder = connect(&server).await;
    let mut fetcher = connect(&server).await;

    activate(&mut forwarder, "C1", "K1", "V").await;
    activate(&mut fetcher, "C1", "K1", "W").await;
    server
        .db
        .create_peer_connection("C1", "V", "W", "c-p1")
        .await
        .unwrap();

    send_json(
        &mut fetcher,
        r#"{"type":"SIGNAL","payload":{"connection_id":"c-p1","signal_type":"candidate","signal_data":"cand-1"}}"#,
    )
    .await;

    let relayed = recv_json(&mut forwarder).await;
    assert_eq!(relayed["type"], "SIGNAL");
    assert_eq!(relayed["connection_id"], "c-p1");
    assert_eq!(relayed["signal_type"], "candidate");
    assert_eq!(relayed["signal_data"], "cand-1");
}

#[tokio::test]
async fn forward_offer_reaches_the_forwarder() {
    let server = start_server().await;
    let mut forwarder = connect(&server).await;
    let mut fetcher = connect(&server).await;

    activate(&mut forwarder, "C1", "K1", "V").await;
    activate(&mut fetcher, "C1", "K1", "W").await;
    server
        .db
        .create_peer_connection("C1", "V", "W", "c-p1")
        .await
        .unwrap();

    send_json(
        &mut fetcher,
        r#"{"type":"FORWARD","payload":{"connection_id":"c-p1","sdp":"offer-w"}}"#,
    )
    .await;

    let relayed = recv_json(&mut forwarder).await;
    assert_eq!(relayed["type"], "FORWARDING");
    assert_eq!(relayed["connection_id"], "c-p1");
    assert_eq!(relayed["sdp"], "offer-w");
}

#[tokio::test]
async fn referencing_a_foreign_connection_closes_the_socket() {
    let server = start_server().await;
    let mut intruder = connect(&server).await;

    activate(&mut intruder, "C1", "K1", "X").await;
    // A connection between two other clients.
    server
        .db
        .create_peer_connection("C1", "V", "W", "c-p1")
        .await
        .unwrap();

    send_json(
        &mut intruder,
        r#"{"type":"CONNECTED","payload":{"connection_id":"c-p1"}}"#,
    )
    .await;

    assert_closed(&mut intruder).await;
}

#[tokio::test]
async fn malformed_frame_is_skipped_and_session_survives() {
    let server = start_server().await;
    let mut forwarder = connect(&server).await;
    let mut fetcher = connect(&server).await;

    activate(&mut forwarder, "C1", "K1", "V").await;
    activate(&mut fetcher, "C1", "K1", "W").await;
    server
        .db
        .create_peer_connection("C1", "V", "W", "c-p1")
        .await
        .unwrap();

    send_json(&mut fetcher, r#"{"type":"BOGUS","payload":{}}"#).await;
    send_json(&mut fetcher, "not even json").await;

    // The session still relays after the junk.
    send_json(
        &mut fetcher,
        r#"{"type":"SIGNAL","payload":{"connection_id":"c-p1","signal_type":"answer","signal_data":"sdp"}}"#,
    )
    .await;
    let relayed = recv_json(&mut forwarder).await;
    assert_eq!(relayed["type"], "SIGNAL");
}

#[tokio::test]
async fn disconnect_publishes_deactivate() {
    let server = start_server().await;
    let mut socket = connect(&server).await;

    activate(&mut socket, "C1", "K1", "V").await;
    for _ in 0..100 {
        if server.db.find_client("C1", "V").await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drop(socket);

    // The coordinator removes the client once DEACTIVATE lands.
    for _ in 0..200 {
        if server.db.find_client("C1", "V").await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client was never deactivated");
}

#[tokio::test]
async fn server_frames_reach_the_addressed_client_only() {
    let server = start_server().await;
    let mut v = connect(&server).await;
    let mut w = connect(&server).await;

    activate(&mut v, "C1", "K1", "V").await;
    activate(&mut w, "C1", "K1", "W").await;

    server
        .broker
        .publish(
            Topic::ClientSocket,
            Detail::socket("C1", "W"),
            meshcast_core::message::Message::Frame(meshcast_core::wire::ServerFrame::Forward {
                connection_id: "c-p9".into(),
            }),
        )
        .await
        .unwrap();

    let frame = recv_json(&mut w).await;
    assert_eq!(frame["type"], "FORWARD");
    assert_eq!(frame["connection_id"], "c-p9");

    // V must not have received anything.
    let nothing = tokio::time::timeout(Duration::from_millis(200), v.next()).await;
    assert!(nothing.is_err());
}
