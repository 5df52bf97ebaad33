//! End-to-end coordination scenarios driven through the broker.
//!
//! These tests run the real coordinator and classifier dispatch loops and
//! play the part of the signal controller and media façade by publishing
//! their events directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshcast_core::broker::{Broker, Detail, Topic};
use meshcast_core::config::{ClassifierConfig, CoordinatorConfig};
use meshcast_core::db::{ClientClass, SignalDatabase};
use meshcast_core::message::{
    Activate, Classified, Connected, Deactivate, Message, Pull, Push,
};
use meshcast_core::wire::ServerFrame;
use meshcast_server::classifier::Classifier;
use meshcast_server::coordinator::Coordinator;
use meshcast_server::metrics::Metrics;
use meshcast_server::pool::ForwarderPool;

struct Stack {
    broker: Arc<Broker>,
    db: SignalDatabase,
    pool: Arc<ForwarderPool>,
}

async fn start_stack(peer_mode: bool) -> Stack {
    let broker = Arc::new(Broker::new());
    let db = SignalDatabase::open_in_memory().await.unwrap();
    db.ensure_default_channel("C1", "K1").await.unwrap();

    let metrics = Arc::new(Metrics::new().unwrap());
    let pool = Arc::new(ForwarderPool::new(db.clone()));
    let coordinator = Arc::new(Coordinator::new(
        CoordinatorConfig {
            max_forwarding_number: 1,
            set_peer_connection: peer_mode,
        },
        Arc::clone(&broker),
        metrics,
        db.clone(),
        Arc::clone(&pool),
    ));
    let classifier = Arc::new(Classifier::new(
        ClassifierConfig { interval_secs: 3600 },
        Arc::clone(&broker),
        db.clone(),
    ));

    tokio::spawn(coordinator.run());
    tokio::spawn(classifier.run());

    // Let the dispatch loops register their subscriptions before any
    // publish happens.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Stack { broker, db, pool }
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn activate(stack: &Stack, channel: &str, client: &str) {
    stack
        .broker
        .publish(
            Topic::Client,
            Detail::Activate,
            Message::Activate(Activate {
                channel_id: channel.into(),
                client_id: client.into(),
            }),
        )
        .await
        .unwrap();
    let db = stack.db.clone();
    let (channel, client) = (channel.to_string(), client.to_string());
    wait_until("client activation", || {
        let db = db.clone();
        let (channel, client) = (channel.clone(), client.clone());
        async move { db.find_client(&channel, &client).await.is_ok() }
    })
    .await;
}

#[tokio::test]
async fn publish_and_single_pull() {
    let stack = start_stack(false).await;
    let mut upstream_cmd = stack.broker.subscribe(Topic::Media, Detail::Upstream).await;
    let mut downstream_cmd = stack
        .broker
        .subscribe(Topic::Media, Detail::Downstream)
        .await;

    // Publisher P activates and pushes.
    activate(&stack, "C1", "P").await;
    stack
        .broker
        .publish(
            Topic::Client,
            Detail::Push,
            Message::Push(Push {
                connection_id: "c-pub".into(),
                channel_id: "C1".into(),
                client_id: "P".into(),
                sdp: "sdp-off-1".into(),
            }),
        )
        .await
        .unwrap();

    let Message::Upstream(cmd) = upstream_cmd.recv().await.unwrap() else {
        panic!("expected upstream command");
    };
    assert_eq!(cmd.connection_id, "c-pub");
    assert_eq!(cmd.key, "C1P");
    assert_eq!(cmd.sdp, "sdp-off-1");
    assert_eq!(stack.db.find_upstream("C1").await.unwrap().id, "c-pub");

    // Viewer V activates and pulls; the downstream command references the
    // publisher's stream.
    activate(&stack, "C1", "V").await;
    stack
        .broker
        .publish(
            Topic::Client,
            Detail::Pull,
            Message::Pull(Pull {
                connection_id: "c-v1".into(),
                channel_id: "C1".into(),
                client_id: "V".into(),
                sdp: "sdp-off-v1".into(),
            }),
        )
        .await
        .unwrap();

    let Message::Downstream(cmd) = downstream_cmd.recv().await.unwrap() else {
        panic!("expected downstream command");
    };
    assert_eq!(cmd.connection_id, "c-v1");
    assert_eq!(cmd.stream_id, "c-pub");
    assert_eq!(cmd.key, "C1V");

    let downstream = stack.db.find_downstream("C1", "V").await.unwrap();
    assert_eq!(downstream.id, "c-v1");
}

#[tokio::test]
async fn balance_on_second_viewer() {
    let stack = start_stack(true).await;
    let mut w_socket = stack
        .broker
        .subscribe(Topic::ClientSocket, Detail::socket("C1", "W"))
        .await;
    let mut clear_cmd = stack.broker.subscribe(Topic::Media, Detail::Clear).await;

    activate(&stack, "C1", "V").await;
    activate(&stack, "C1", "W").await;
    stack.db.create_pull_connection("C1", "V", "c-v1").await.unwrap();
    stack.db.create_pull_connection("C1", "W", "c-w1").await.unwrap();

    // V's server download connects: no forwarder yet, V joins the pool.
    stack
        .broker
        .publish(
            Topic::Media,
            Detail::Connected,
            Message::Connected(Connected {
                connection_id: "c-v1".into(),
            }),
        )
        .await
        .unwrap();

    // W's server download connects: V is the top forwarder, W gets a
    // FORWARD directive naming a fresh peer connection.
    let pool = Arc::clone(&stack.pool);
    wait_until("V pooled", || {
        let pool = Arc::clone(&pool);
        async move { pool.top_forwarder("C1").await.is_some() }
    })
    .await;

    stack
        .broker
        .publish(
            Topic::Media,
            Detail::Connected,
            Message::Connected(Connected {
                connection_id: "c-w1".into(),
            }),
        )
        .await
        .unwrap();

    let Message::Frame(ServerFrame::Forward { connection_id }) = w_socket.recv().await.unwrap()
    else {
        panic!("expected FORWARD directive");
    };
    let peer = stack.db.find_connection(&connection_id).await.unwrap();
    assert_eq!(peer.from_id, "V");
    assert_eq!(peer.to_id, "W");

    // The peer link comes up: W's server download is dropped and the media
    // server told to clear the branch.
    stack
        .broker
        .publish(
            Topic::Peer,
            Detail::Connected,
            Message::Connected(Connected {
                connection_id: connection_id.clone(),
            }),
        )
        .await
        .unwrap();

    let Message::Clear(clear) = clear_cmd.recv().await.unwrap() else {
        panic!("expected clear command");
    };
    assert_eq!(clear.connection_id, "c-w1");

    let db = stack.db.clone();
    wait_until("server download removed", || {
        let db = db.clone();
        async move { db.find_connection("c-w1").await.is_err() }
    })
    .await;
}

#[tokio::test]
async fn forwarder_deactivation_fans_out() {
    let stack = start_stack(true).await;
    let mut w_socket = stack
        .broker
        .subscribe(Topic::ClientSocket, Detail::socket("C1", "W"))
        .await;

    activate(&stack, "C1", "V").await;
    activate(&stack, "C1", "W").await;
    stack.db.create_peer_connection("C1", "V", "W", "c-p1").await.unwrap();

    stack
        .broker
        .publish(
            Topic::Client,
            Detail::Deactivate,
            Message::Deactivate(Deactivate {
                channel_id: "C1".into(),
                client_id: "V".into(),
            }),
        )
        .await
        .unwrap();

    let Message::Frame(ServerFrame::Closed { connection_id }) = w_socket.recv().await.unwrap()
    else {
        panic!("expected CLOSED notification");
    };
    assert_eq!(connection_id, "c-p1");

    let db = stack.db.clone();
    wait_until("forwarder torn down", || {
        let db = db.clone();
        async move {
            db.find_connection("c-p1").await.is_err() && db.find_client("C1", "V").await.is_err()
        }
    })
    .await;

    // W survives and may re-issue PULL.
    assert!(stack.db.find_client("C1", "W").await.is_ok());
}

#[tokio::test]
async fn publisher_departure_cascades() {
    let stack = start_stack(true).await;
    let mut close_cmd = stack.broker.subscribe(Topic::Media, Detail::Close).await;

    activate(&stack, "C1", "P").await;
    activate(&stack, "C1", "V").await;
    stack.db.create_push_connection("C1", "P", "c-pub").await.unwrap();
    stack.db.create_pull_connection("C1", "V", "c-v1").await.unwrap();

    stack
        .broker
        .publish(
            Topic::Client,
            Detail::Deactivate,
            Message::Deactivate(Deactivate {
                channel_id: "C1".into(),
                client_id: "P".into(),
            }),
        )
        .await
        .unwrap();

    let Message::Close(close) = close_cmd.recv().await.unwrap() else {
        panic!("expected close command");
    };
    assert_eq!(close.connection_id, "c-pub");

    let db = stack.db.clone();
    wait_until("channel cascade", || {
        let db = db.clone();
        async move {
            db.find_channel("C1").await.is_err()
                && db.find_all_by_channel("C1").await.unwrap().is_empty()
        }
    })
    .await;
}

#[tokio::test]
async fn classifier_promotion_and_demotion() {
    let stack = start_stack(false).await;

    activate(&stack, "C1", "X").await;
    activate(&stack, "C1", "Y").await;
    stack
        .db
        .update_client_class("C1", "Y", ClientClass::Fetcher)
        .await
        .unwrap();
    stack
        .db
        .create_classify_connection("C1", "X", "Y", "c-cl")
        .await
        .unwrap();

    stack
        .broker
        .publish(
            Topic::Classification,
            Detail::Classified,
            Message::Classified(Classified {
                connection_id: "c-cl".into(),
                channel_id: "C1".into(),
                success: true,
            }),
        )
        .await
        .unwrap();

    let db = stack.db.clone();
    wait_until("promotion to forwarder", || {
        let db = db.clone();
        async move {
            db.find_client("C1", "X")
                .await
                .is_ok_and(|x| x.class == ClientClass::Forwarder)
        }
    })
    .await;

    // A failed probe on a fresh connection demotes instead.
    stack
        .db
        .create_classify_connection("C1", "X", "Y", "c-cl2")
        .await
        .unwrap();
    stack
        .broker
        .publish(
            Topic::Classification,
            Detail::Classified,
            Message::Classified(Classified {
                connection_id: "c-cl2".into(),
                channel_id: "C1".into(),
                success: false,
            }),
        )
        .await
        .unwrap();

    let db = stack.db.clone();
    wait_until("demotion to fetcher", || {
        let db = db.clone();
        async move {
            db.find_client("C1", "X")
                .await
                .is_ok_and(|x| x.class == ClientClass::Fetcher)
        }
    })
    .await;
}

#[tokio::test]
async fn duplicate_push_is_rejected() {
    let stack = start_stack(false).await;
    let mut upstream_cmd = stack.broker.subscribe(Topic::Media, Detail::Upstream).await;

    activate(&stack, "C1", "P").await;
    activate(&stack, "C1", "Q").await;

    stack
        .broker
        .publish(
            Topic::Client,
            Detail::Push,
            Message::Push(Push {
                connection_id: "c-pub".into(),
                channel_id: "C1".into(),
                client_id: "P".into(),
                sdp: "a".into(),
            }),
        )
        .await
        .unwrap();
    let _ = upstream_cmd.recv().await.unwrap();

    stack
        .broker
        .publish(
            Topic::Client,
            Detail::Push,
            Message::Push(Push {
                connection_id: "c-pub-2".into(),
                channel_id: "C1".into(),
                client_id: "Q".into(),
                sdp: "b".into(),
            }),
        )
        .await
        .unwrap();

    // The second push neither records a connection nor reaches media.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stack.db.find_connection("c-pub-2").await.is_err());
    assert!(upstream_cmd.try_recv().is_err());
    assert_eq!(stack.db.find_upstream("C1").await.unwrap().from_id, "P");
}
