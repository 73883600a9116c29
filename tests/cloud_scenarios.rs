/// End to end scenarios: several clients talking through one in-process node

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use maritime_cloud::{
    BroadcastAck, BroadcastMessage, BroadcastMessageHeader, BroadcastOptions, ClientConfiguration, ClientError,
    ConnectionEvent, ConnectionState, InvocationContext, LocalNode, MaritimeCloudClient, MaritimeId, PositionTime,
    Service, ServiceInitiationPoint, ServiceMessage,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PositionReport {
    vessel: String,
    speed: f64,
}

impl BroadcastMessage for PositionReport {
    const CHANNEL: &'static str = "x.Channel";
}

struct EchoService;

impl Service for EchoService {
    const NAME: &'static str = "imo.Echo";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Echo {
    text: String,
}

impl ServiceMessage for Echo {
    type Service = EchoService;
    type Reply = String;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connected_client(node: &LocalNode, id: &str) -> MaritimeCloudClient {
    let client = ClientConfiguration::create(id)
        .auto_connect(false)
        .invocation_timeout(Duration::from_secs(5))
        .build(node.transport())
        .expect("valid configuration");
    client.connection().connect().await.expect("connect");
    client
}

async fn wait_until_connected(client: &MaritimeCloudClient) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !client.connection().is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("auto connect");
}

fn report(n: usize) -> PositionReport {
    PositionReport {
        vessel: format!("vessel-{}", n),
        speed: n as f64,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_reaches_only_prior_subscribers() {
    init_tracing();
    let node = LocalNode::new();
    let a = connected_client(&node, "mmsi://1").await;
    let b = connected_client(&node, "mmsi://2").await;
    let c = connected_client(&node, "mmsi://3").await;

    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    b.listen::<PositionReport, _>(move |header: &BroadcastMessageHeader, message: &PositionReport| {
        let _ = b_tx.send((header.sender.clone(), message.clone()));
    })
    .unwrap();

    a.broadcast(&report(1)).unwrap().await.unwrap();
    let (sender, received) = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sender, MaritimeId::new("mmsi://1"));
    assert_eq!(received, report(1));

    let (c_tx, mut c_rx) = mpsc::unbounded_channel();
    c.listen::<PositionReport, _>(move |_: &BroadcastMessageHeader, message: &PositionReport| {
        let _ = c_tx.send(message.clone());
    })
    .unwrap();

    a.broadcast(&report(2)).unwrap().await.unwrap();
    let first_seen_by_c = tokio::time::timeout(Duration::from_secs(2), c_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_seen_by_c, report(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_invocation_round_trip() {
    init_tracing();
    let node = LocalNode::new();
    let a = connected_client(&node, "mmsi://1").await;
    let b = connected_client(&node, "mmsi://2").await;

    let registration = b
        .register(ServiceInitiationPoint::<Echo>::new(), |message: Echo, context: InvocationContext<String>| {
            context.complete(message.text)
        })
        .unwrap();
    assert!(registration.await_registered(Duration::from_secs(2)).await);

    let reply = a
        .invoke(b.client_id(), &Echo { text: "hello".into() })
        .unwrap()
        .await
        .unwrap();
    assert_eq!(reply, "hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn asynchronous_callbacks_may_reply_later() {
    let node = LocalNode::new();
    let a = connected_client(&node, "mmsi://1").await;
    let b = connected_client(&node, "mmsi://2").await;

    b.register(ServiceInitiationPoint::<Echo>::new(), |message: Echo, context: InvocationContext<String>| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            context.complete(message.text.to_uppercase());
        });
    })
    .unwrap();

    let reply = a.invoke(b.client_id(), &Echo { text: "later".into() }).unwrap().await.unwrap();
    assert_eq!(reply, "LATER");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn target_disconnecting_fails_the_invocation() {
    let node = LocalNode::new();
    let a = connected_client(&node, "mmsi://1").await;
    let b = connected_client(&node, "mmsi://2").await;

    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    b.register(ServiceInitiationPoint::<Echo>::new(), move |_: Echo, context: InvocationContext<String>| {
        // hold the context so no reply is sent
        let _ = held_tx.send(context);
    })
    .unwrap();

    let pending = a.invoke(b.client_id(), &Echo { text: "anyone?".into() }).unwrap();
    let held = held_rx.recv().await.unwrap();
    b.connection().disconnect().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("future resolves")
        .unwrap_err();
    assert!(err.is_connection_failure() || err.is_timeout(), "unexpected {:?}", err);
    drop(held);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_invocations_never_cross_replies() {
    let node = LocalNode::new();
    let a = Arc::new(connected_client(&node, "mmsi://1").await);
    let b = connected_client(&node, "mmsi://2").await;
    // replies come back in a shuffled order
    b.register(ServiceInitiationPoint::<Echo>::new(), |message: Echo, context: InvocationContext<String>| {
        let delay = Duration::from_millis(rand::random::<u64>() % 20);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            context.complete(message.text);
        });
    })
    .unwrap();

    let target = b.client_id().clone();
    let handles: Vec<_> = (0..100)
        .map(|n| {
            let a = a.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let text = format!("call-{}", n);
                let reply = a.invoke(&target, &Echo { text: text.clone() }).unwrap().await.unwrap();
                assert_eq!(reply, text);
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_subscription_stays_silent_under_flood() {
    let node = LocalNode::new();
    let a = Arc::new(connected_client(&node, "mmsi://1").await);
    let b = connected_client(&node, "mmsi://2").await;

    let after_cancel = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let subscription = {
        let after_cancel = after_cancel.clone();
        let cancelled = cancelled.clone();
        b.listen::<PositionReport, _>(move |_: &BroadcastMessageHeader, _: &PositionReport| {
            if cancelled.load(Ordering::SeqCst) {
                after_cancel.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap()
    };

    let flood = {
        let a = a.clone();
        tokio::spawn(async move {
            for n in 0..500 {
                let _ = a.broadcast(&report(n)).unwrap().await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    subscription.cancel();
    // flag after cancel returns; a delivery started before may still finish
    cancelled.store(true, Ordering::SeqCst);
    subscription.cancel();
    flood.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(after_cancel.load(Ordering::SeqCst) <= 1);
    assert!(!subscription.is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receiver_acknowledgments_reach_the_sender() {
    let node = LocalNode::new();
    let a = connected_client(&node, "mmsi://1").await;
    let b = connected_client(&node, "mmsi://2").await;
    b.listen::<PositionReport, _>(|_: &BroadcastMessageHeader, _: &PositionReport| {}).unwrap();

    let future = a
        .broadcast_with(&report(7), BroadcastOptions::default().with_receiver_ack(true))
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    future.on_ack(move |ack: &BroadcastAck| {
        let _ = tx.send(ack.receiver.clone());
    });
    future.await.unwrap();

    let receiver = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(receiver, MaritimeId::new("mmsi://2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receiver_filter_limits_the_audience() {
    let node = LocalNode::new();
    let a = connected_client(&node, "mmsi://1").await;
    let near = ClientConfiguration::create("mmsi://2")
        .auto_connect(false)
        .position_supplier(|| PositionTime::now(55.0, 12.0))
        .build(node.transport())
        .unwrap();
    near.connection().connect().await.unwrap();
    let far = connected_client(&node, "mmsi://3").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for client in [&near, &far] {
        let tx = tx.clone();
        let id = client.client_id().clone();
        client
            .listen::<PositionReport, _>(move |_: &BroadcastMessageHeader, _: &PositionReport| {
                let _ = tx.send(id.clone());
            })
            .unwrap();
    }

    let options = BroadcastOptions::default()
        .with_receiver_filter(|_: &MaritimeId, position: &PositionTime| position.latitude > 50.0);
    a.broadcast_with(&report(1), options).unwrap().await.unwrap();

    let receiver = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(receiver, MaritimeId::new("mmsi://2"));
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locate_finds_registered_providers() {
    let node = LocalNode::new();
    let a = connected_client(&node, "mmsi://1").await;
    let b = connected_client(&node, "mmsi://2").await;

    let locator = a.locate(ServiceInitiationPoint::<Echo>::new()).unwrap();
    assert!(locator.nearest().await.unwrap().is_none());

    b.register(ServiceInitiationPoint::<Echo>::new(), |message: Echo, context: InvocationContext<String>| {
        context.complete(format!("{}!", message.text))
    })
    .unwrap()
    .await_registered(Duration::from_secs(2))
    .await;

    let endpoint = locator.nearest().await.unwrap().expect("provider");
    assert_eq!(endpoint.id(), b.client_id());
    let reply = endpoint.invoke(&Echo { text: "found".into() }).unwrap().await.unwrap();
    assert_eq!(reply, "found!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn services_are_announced_again_after_reconnect() {
    let node = LocalNode::new();
    let b = connected_client(&node, "mmsi://2").await;
    let registration = b
        .register(ServiceInitiationPoint::<Echo>::new(), |message: Echo, context: InvocationContext<String>| {
            context.complete(message.text)
        })
        .unwrap();
    assert!(registration.await_registered(Duration::from_secs(2)).await);

    b.connection().disconnect().await.unwrap();
    assert!(node.providers(EchoService::NAME).is_empty());

    b.connection().connect().await.unwrap();
    assert!(registration.await_registered(Duration::from_secs(2)).await);
    assert_eq!(node.providers(EchoService::NAME), vec![b.client_id().clone()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_runs_through_to_termination() {
    init_tracing();
    let node = LocalNode::new();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = {
        let seen = seen.clone();
        move |event: &ConnectionEvent| {
            if let Some(state) = event.new_state() {
                seen.lock().push(state);
            }
        }
    };
    let client = Arc::new(
        ClientConfiguration::create("mmsi://1")
            .add_listener(recorder)
            .build(node.transport())
            .unwrap(),
    );
    wait_until_connected(&client).await;

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.await_termination(Duration::from_secs(5)).await })
        })
        .collect();

    client.close();
    assert!(client.is_closed());
    for waiter in waiters {
        assert!(waiter.await.unwrap());
    }
    assert!(client.is_terminated());
    assert!(matches!(
        client.invoke(&MaritimeId::new("mmsi://2"), &Echo { text: "late".into() }),
        Err(ClientError::ConnectionClosed)
    ));

    use ConnectionState::*;
    assert_eq!(*seen.lock(), vec![Connecting, Connected, Closing, Closed, Terminated]);
}

#[tokio::test]
async fn node_kick_is_seen_as_connection_loss() {
    let node = LocalNode::new();
    let client = connected_client(&node, "mmsi://1").await;
    let mut events = client.connection().events();

    assert!(node.kick(client.client_id()));
    assert!(events.wait_for(ConnectionState::Disconnected).await);
    assert!(!client.is_closed());

    client.connection().connect().await.unwrap();
    assert!(node.is_connected(client.client_id()));
}
